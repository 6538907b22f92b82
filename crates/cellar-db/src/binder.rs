//! Positional parameter marshaling.
//!
//! Every parameter passed to [`Conn::prepare`](crate::Conn::prepare) is a
//! [`Param`]: an erased snapshot of some `T: Serialize`. When the statement
//! is bound, the parameter runs through [`RULES`], an ordered list of
//! encoders; the first rule that accepts the value decides its SQL encoding.
//!
//! | # | rule       | accepts                                              | binds as             |
//! |---|------------|------------------------------------------------------|----------------------|
//! | 1 | `null`     | `None`, `()`                                         | NULL                 |
//! | 2 | `blob`     | `Vec<u8>`, `[u8; N]`, serde bytes, all-`u8` sequences | BLOB                 |
//! | 3 | `json`     | other sequences and maps                             | TEXT (JSON)          |
//! | 4 | `text`     | `str`, `String`, `char`                              | TEXT                 |
//! | 5 | `integer`  | every integer width                                  | INTEGER              |
//! | 6 | `real`     | `f32`, `f64`                                         | REAL                 |
//! | 7 | `boolean`  | `bool`                                               | INTEGER 0/1          |
//! | 8 | `time`     | `chrono::DateTime`, `NaiveDateTime`, `SystemTime`    | INTEGER (Unix secs)  |
//! | 9 | `rendered` | values serialized with `collect_str`, unit variants  | TEXT                 |
//! | 10| `record`   | structs and data-carrying enum variants              | TEXT (JSON)          |
//!
//! Anything left over fails with [`Error::UnknownParameterType`].
//!
//! The order matters: a `SystemTime` is a record and a `DateTime` is a
//! rendered value as far as serde is concerned, so the time rule has to run
//! before rules 9 and 10.

use std::any::{type_name, Any};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, Utc};
use rusqlite::types::Value;
use serde::{Serialize, Serializer};

use crate::error::{Error, Result};
use crate::probe::{shape_of, Shape};

/// Builds a `Vec<Param>` from a list of expressions.
///
/// ```
/// let params = cellar_db::params![1, "two", 3.0, None::<i64>];
/// assert_eq!(params.len(), 4);
/// ```
///
/// Each expression goes through [`Param::new`], which needs an owned or
/// `'static` value. Borrowed strings and byte slices go through
/// [`Param::text`] and [`Param::blob`], or `Param::from`:
///
/// ```
/// use cellar_db::Param;
///
/// let name = String::from("ada");
/// let bytes = vec![1u8, 2, 3];
/// let params = vec![Param::from(name.as_str()), Param::from(&bytes[..])];
/// assert_eq!(params[0].rule(), Some("text"));
/// assert_eq!(params[1].rule(), Some("blob"));
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::Param>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::Param::new(&$value)),+]
    };
}

/// One positional parameter, captured for binding.
#[derive(Debug, Clone)]
pub struct Param {
    type_name: &'static str,
    shape: Result<Shape, String>,
    bytes: Option<Vec<u8>>,
    instant: Option<i64>,
    json: Option<Result<String, String>>,
}

impl Param {
    /// Captures `value` for binding.
    ///
    /// `T` must be `'static` so that byte buffers and time instants can be
    /// recognised by type. Borrowed text and bytes with a shorter lifetime
    /// go through [`Param::text`] and [`Param::blob`].
    pub fn new<T: Serialize + Any>(value: &T) -> Self {
        let any: &dyn Any = value;
        let shape = shape_of(value);
        let bytes = bytes_of(any);
        let instant = instant_of(any);
        let json = match &shape {
            Ok(Shape::Seq | Shape::Map | Shape::Record) if bytes.is_none() && instant.is_none() => {
                Some(serde_json::to_string(value).map_err(|err| err.to_string()))
            }
            _ => None,
        };
        Self {
            type_name: type_name::<T>(),
            shape,
            bytes,
            instant,
            json,
        }
    }

    /// A text parameter from any string slice.
    pub fn text(value: impl Into<String>) -> Self {
        Self::from_shape(type_name::<String>(), Shape::Str(value.into()))
    }

    /// A blob parameter from any byte buffer.
    pub fn blob(value: impl Into<Vec<u8>>) -> Self {
        let mut param = Self::from_shape(type_name::<Vec<u8>>(), Shape::Seq);
        param.bytes = Some(value.into());
        param
    }

    /// An explicit SQL NULL.
    pub fn null() -> Self {
        Self::from_shape("null", Shape::Null)
    }

    fn from_shape(type_name: &'static str, shape: Shape) -> Self {
        Self {
            type_name,
            shape: Ok(shape),
            bytes: None,
            instant: None,
            json: None,
        }
    }

    /// Rust type name of the captured value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Name of the rule that will encode this parameter, or `None` when no
    /// rule accepts it.
    pub fn rule(&self) -> Option<&'static str> {
        RULES
            .iter()
            .find(|rule| (rule.apply)(self).is_some())
            .map(|rule| rule.name)
    }

    /// Encodes the parameter for position `index` (one-based).
    pub fn encode(&self, index: usize) -> Result<Value> {
        for rule in RULES {
            if let Some(encoded) = (rule.apply)(self) {
                return encoded.map_err(|message| Error::Encode {
                    index,
                    type_name: self.type_name,
                    message,
                });
            }
        }
        if let Err(message) = &self.shape {
            return Err(Error::Encode {
                index,
                type_name: self.type_name,
                message: message.clone(),
            });
        }
        Err(Error::UnknownParameterType {
            index,
            type_name: self.type_name,
        })
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Self::text(value)
    }
}

impl From<&[u8]> for Param {
    fn from(value: &[u8]) -> Self {
        Self::blob(value)
    }
}

/// Binds `T` through its `Display` impl (binder rule 9).
///
/// ```
/// use std::net::Ipv4Addr;
/// let param = cellar_db::Param::new(&cellar_db::Rendered(Ipv4Addr::LOCALHOST));
/// assert_eq!(param.rule(), Some("rendered"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendered<T>(pub T);

impl<T: fmt::Display> Serialize for Rendered<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

/// One entry of the precedence table. `apply` returns `None` when the rule
/// does not accept the parameter.
pub struct Rule {
    /// Stable rule name, reported by [`Param::rule`].
    pub name: &'static str,
    apply: fn(&Param) -> Option<Result<Value, String>>,
}

/// The binder's precedence table, evaluated top to bottom.
pub static RULES: &[Rule] = &[
    Rule {
        name: "null",
        apply: null,
    },
    Rule {
        name: "blob",
        apply: blob,
    },
    Rule {
        name: "json",
        apply: json_collection,
    },
    Rule {
        name: "text",
        apply: text,
    },
    Rule {
        name: "integer",
        apply: integer,
    },
    Rule {
        name: "real",
        apply: real,
    },
    Rule {
        name: "boolean",
        apply: boolean,
    },
    Rule {
        name: "time",
        apply: time,
    },
    Rule {
        name: "rendered",
        apply: rendered,
    },
    Rule {
        name: "record",
        apply: record,
    },
];

fn null(param: &Param) -> Option<Result<Value, String>> {
    matches!(param.shape, Ok(Shape::Null)).then_some(Ok(Value::Null))
}

fn blob(param: &Param) -> Option<Result<Value, String>> {
    if let Some(bytes) = &param.bytes {
        return Some(Ok(Value::Blob(bytes.clone())));
    }
    match &param.shape {
        Ok(Shape::Blob(bytes)) => Some(Ok(Value::Blob(bytes.clone()))),
        _ => None,
    }
}

fn json_collection(param: &Param) -> Option<Result<Value, String>> {
    match param.shape {
        Ok(Shape::Seq | Shape::Map) => param.json_text(),
        _ => None,
    }
}

fn text(param: &Param) -> Option<Result<Value, String>> {
    match &param.shape {
        Ok(Shape::Str(s)) => Some(Ok(Value::Text(s.clone()))),
        _ => None,
    }
}

fn integer(param: &Param) -> Option<Result<Value, String>> {
    match param.shape {
        Ok(Shape::Int(v)) => Some(Ok(Value::Integer(v))),
        Ok(Shape::Byte(v)) => Some(Ok(Value::Integer(i64::from(v)))),
        _ => None,
    }
}

fn real(param: &Param) -> Option<Result<Value, String>> {
    match param.shape {
        Ok(Shape::Float(v)) => Some(Ok(Value::Real(v))),
        _ => None,
    }
}

fn boolean(param: &Param) -> Option<Result<Value, String>> {
    match param.shape {
        Ok(Shape::Bool(v)) => Some(Ok(Value::Integer(i64::from(v)))),
        _ => None,
    }
}

fn time(param: &Param) -> Option<Result<Value, String>> {
    param.instant.map(|secs| Ok(Value::Integer(secs)))
}

fn rendered(param: &Param) -> Option<Result<Value, String>> {
    match &param.shape {
        Ok(Shape::Rendered(s)) => Some(Ok(Value::Text(s.clone()))),
        _ => None,
    }
}

fn record(param: &Param) -> Option<Result<Value, String>> {
    match param.shape {
        Ok(Shape::Record) => param.json_text(),
        _ => None,
    }
}

impl Param {
    fn json_text(&self) -> Option<Result<Value, String>> {
        self.json
            .as_ref()
            .map(|json| json.clone().map(Value::Text))
    }
}

fn bytes_of(value: &dyn Any) -> Option<Vec<u8>> {
    if let Some(bytes) = value.downcast_ref::<Vec<u8>>() {
        return Some(bytes.clone());
    }
    if let Some(bytes) = value.downcast_ref::<&'static [u8]>() {
        return Some(bytes.to_vec());
    }
    if let Some(bytes) = value.downcast_ref::<Box<[u8]>>() {
        return Some(bytes.to_vec());
    }
    if let Some(Some(bytes)) = value.downcast_ref::<Option<Vec<u8>>>() {
        return Some(bytes.clone());
    }
    // Serde writes `[T; 0]` as an empty tuple whatever `T` is.
    if value.is::<[u8; 0]>() {
        return Some(Vec::new());
    }
    None
}

fn instant_of(value: &dyn Any) -> Option<i64> {
    macro_rules! instant {
        ($($ty:ty => $secs:expr),+ $(,)?) => {
            $(
                if let Some(t) = value.downcast_ref::<$ty>() {
                    return Some($secs(t));
                }
                if let Some(Some(t)) = value.downcast_ref::<Option<$ty>>() {
                    return Some($secs(t));
                }
            )+
        };
    }

    instant! {
        DateTime<Utc> => |t: &DateTime<Utc>| t.timestamp(),
        DateTime<FixedOffset> => |t: &DateTime<FixedOffset>| t.timestamp(),
        DateTime<Local> => |t: &DateTime<Local>| t.timestamp(),
        NaiveDateTime => |t: &NaiveDateTime| t.and_utc().timestamp(),
        SystemTime => |t: &SystemTime| unix_seconds(*t),
    }
    None
}

/// Whole seconds since the Unix epoch, floored like `DateTime::timestamp`.
fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
        Err(err) => {
            let before = err.duration();
            let secs = i64::try_from(before.as_secs()).unwrap_or(i64::MAX);
            if before.subsec_nanos() > 0 {
                -secs - 1
            } else {
                -secs
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Serialize)]
    struct Person {
        name: String,
        age: u32,
    }

    #[derive(Serialize)]
    struct Marker;

    fn rule_of<T: Serialize + Any>(value: T) -> Option<&'static str> {
        Param::new(&value).rule()
    }

    #[test]
    fn precedence_table_order_is_stable() {
        let names: Vec<_> = RULES.iter().map(|rule| rule.name).collect();
        assert_eq!(
            names,
            [
                "null", "blob", "json", "text", "integer", "real", "boolean", "time", "rendered",
                "record"
            ]
        );
    }

    #[test]
    fn each_shape_picks_its_rule() {
        assert_eq!(rule_of(None::<String>), Some("null"));
        assert_eq!(rule_of(vec![1u8, 2, 3]), Some("blob"));
        assert_eq!(rule_of(Vec::<u8>::new()), Some("blob"));
        assert_eq!(rule_of(vec!["a", "b"]), Some("json"));
        assert_eq!(rule_of(HashMap::from([("k", 1)])), Some("json"));
        assert_eq!(rule_of("text"), Some("text"));
        assert_eq!(rule_of(String::from("text")), Some("text"));
        assert_eq!(rule_of(42i16), Some("integer"));
        assert_eq!(rule_of(42u8), Some("integer"));
        assert_eq!(rule_of(4.2f32), Some("real"));
        assert_eq!(rule_of(true), Some("boolean"));
        assert_eq!(rule_of(Utc::now()), Some("time"));
        assert_eq!(rule_of(SystemTime::now()), Some("time"));
        assert_eq!(rule_of(Rendered(7)), Some("rendered"));
        assert_eq!(
            rule_of(Person {
                name: "a".into(),
                age: 1
            }),
            Some("record")
        );
        assert_eq!(rule_of(Marker), None);
    }

    #[test]
    fn time_wins_over_record_and_rendered() {
        // SystemTime serializes as a struct, DateTime through collect_str.
        assert_eq!(shape_of(&SystemTime::now()), Ok(Shape::Record));
        assert!(matches!(shape_of(&Utc::now()), Ok(Shape::Rendered(_))));

        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(
            Param::new(&at).encode(1).expect("should encode"),
            Value::Integer(1_700_000_000)
        );
        let dt = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("valid timestamp");
        assert_eq!(
            Param::new(&dt).encode(1).expect("should encode"),
            Value::Integer(1_700_000_000)
        );
    }

    #[test]
    fn offset_times_bind_as_utc_seconds() {
        let dt = DateTime::parse_from_rfc3339("2024-01-01T02:00:00+02:00").expect("valid rfc3339");
        assert_eq!(
            Param::new(&dt).encode(1).expect("should encode"),
            Value::Integer(1_704_067_200)
        );
        assert_eq!(
            Param::new(&Some(dt.with_timezone(&Utc)))
                .encode(1)
                .expect("should encode"),
            Value::Integer(1_704_067_200)
        );
    }

    #[test]
    fn pre_epoch_system_time_floors() {
        let before = UNIX_EPOCH - Duration::from_millis(1500);
        assert_eq!(unix_seconds(before), -2);
        assert_eq!(unix_seconds(UNIX_EPOCH - Duration::from_secs(3)), -3);
    }

    #[test]
    fn scalars_encode() {
        assert_eq!(Param::new(&7i32).encode(1).expect("int"), Value::Integer(7));
        assert_eq!(Param::new(&false).encode(1).expect("bool"), Value::Integer(0));
        assert_eq!(Param::new(&1.25f64).encode(1).expect("real"), Value::Real(1.25));
        assert_eq!(
            Param::new(&'z').encode(1).expect("char"),
            Value::Text("z".into())
        );
        assert_eq!(Param::null().encode(1).expect("null"), Value::Null);
        assert_eq!(
            Param::text(String::from("borrowed")).encode(1).expect("text"),
            Value::Text("borrowed".into())
        );
        assert_eq!(
            Param::blob(&b"raw"[..]).encode(1).expect("blob"),
            Value::Blob(b"raw".to_vec())
        );
    }

    #[test]
    fn only_raw_bytes_bind_as_blobs() {
        assert_eq!(rule_of(vec![Some(1u8), Some(2u8)]), Some("json"));
        assert_eq!(rule_of(vec![Some(1u8), None]), Some("json"));
        assert_eq!(
            Param::new(&vec![Some(1u8), None]).encode(1).expect("seq"),
            Value::Text("[1,null]".into())
        );

        assert_eq!(rule_of([0u8; 0]), Some("blob"));
        assert_eq!(rule_of([7u8; 2]), Some("blob"));
        assert_eq!(
            Param::new(&[0u8; 0]).encode(1).expect("empty array"),
            Value::Blob(Vec::new())
        );
    }

    #[test]
    fn borrowed_values_convert() {
        let owned = String::from("local");
        let bytes = vec![9u8, 8];
        assert_eq!(
            Param::from(owned.as_str()).encode(1).expect("text"),
            Value::Text("local".into())
        );
        assert_eq!(
            Param::from(&bytes[..]).encode(1).expect("blob"),
            Value::Blob(vec![9, 8])
        );
    }

    #[test]
    fn large_unsigned_wraps_to_negative() {
        assert_eq!(
            Param::new(&u64::MAX).encode(1).expect("should encode"),
            Value::Integer(-1)
        );
    }

    #[test]
    fn collections_and_records_encode_as_json() {
        assert_eq!(
            Param::new(&vec![1, 2, 3]).encode(1).expect("seq"),
            Value::Text("[1,2,3]".into())
        );
        let person = Person {
            name: "ada".into(),
            age: 36,
        };
        assert_eq!(
            Param::new(&person).encode(1).expect("record"),
            Value::Text(r#"{"name":"ada","age":36}"#.into())
        );
    }

    #[test]
    fn unknown_type_reports_position_and_name() {
        let err = Param::new(&Marker).encode(3).expect_err("marker should be rejected");
        match err {
            Error::UnknownParameterType { index, type_name } => {
                assert_eq!(index, 3);
                assert!(type_name.ends_with("Marker"), "type name: {type_name}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn json_failure_is_an_encode_error() {
        let mut bad = HashMap::new();
        bad.insert(vec![1u16], 1);
        let err = Param::new(&bad).encode(1).expect_err("non-string keys cannot be json");
        assert!(matches!(err, Error::Encode { index: 1, .. }), "{err:?}");
    }

    #[test]
    fn params_macro_builds_in_order() {
        let params = crate::params![1, "two", 3.5];
        let rules: Vec<_> = params.iter().map(Param::rule).collect();
        assert_eq!(rules, [Some("integer"), Some("text"), Some("real")]);
        assert!(crate::params![].is_empty());
    }
}
