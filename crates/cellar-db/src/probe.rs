//! Discovers the runtime shape of a `Serialize` value.
//!
//! The binder needs to know whether a parameter is a string, an integer, a
//! sequence, a record and so on, without knowing its concrete type. Serde's
//! data model already answers that question: [`Probe`] is a serializer that
//! records which `serialize_*` entry point a value chose and keeps only the
//! scalar payload. Compound values are not walked beyond what is needed to
//! tell a byte sequence apart from any other sequence.

use std::fmt;

use serde::ser::{self, Serialize};

/// The serde-level shape of a value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Shape {
    /// `None` or `()`.
    Null,
    Bool(bool),
    /// Any integer except `u8`. Unsigned values above `i64::MAX` and 128-bit
    /// values are truncated to 64 bits.
    Int(i64),
    /// A lone `u8`.
    Byte(u8),
    Float(f64),
    /// `str` or `char`.
    Str(String),
    /// A value that serialized itself through `collect_str`, or a unit enum
    /// variant.
    Rendered(String),
    /// Raw bytes: `serialize_bytes`, or a non-empty sequence whose elements
    /// were all `u8`.
    Blob(Vec<u8>),
    /// Any other sequence or tuple.
    Seq,
    /// A key-value map.
    Map,
    /// A struct, tuple struct, or enum variant carrying data.
    Record,
    /// A unit struct such as a marker type.
    UnitStruct,
}

#[derive(Debug)]
pub(crate) struct ProbeError(String);

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ProbeError {}

impl ser::Error for ProbeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

/// Returns the shape of `value`.
pub(crate) fn shape_of<T: Serialize + ?Sized>(value: &T) -> Result<Shape, String> {
    value.serialize(Probe).map_err(|err| err.0)
}

pub(crate) struct Probe;

impl ser::Serializer for Probe {
    type Ok = Shape;
    type Error = ProbeError;

    type SerializeSeq = SeqProbe;
    type SerializeTuple = SeqProbe;
    type SerializeTupleStruct = Skip;
    type SerializeTupleVariant = Skip;
    type SerializeMap = Skip;
    type SerializeStruct = Skip;
    type SerializeStructVariant = Skip;

    fn serialize_bool(self, v: bool) -> Result<Shape, ProbeError> {
        Ok(Shape::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Shape, ProbeError> {
        Ok(Shape::Int(i64::from(v)))
    }

    fn serialize_i16(self, v: i16) -> Result<Shape, ProbeError> {
        Ok(Shape::Int(i64::from(v)))
    }

    fn serialize_i32(self, v: i32) -> Result<Shape, ProbeError> {
        Ok(Shape::Int(i64::from(v)))
    }

    fn serialize_i64(self, v: i64) -> Result<Shape, ProbeError> {
        Ok(Shape::Int(v))
    }

    fn serialize_i128(self, v: i128) -> Result<Shape, ProbeError> {
        Ok(Shape::Int(v as i64))
    }

    fn serialize_u8(self, v: u8) -> Result<Shape, ProbeError> {
        Ok(Shape::Byte(v))
    }

    fn serialize_u16(self, v: u16) -> Result<Shape, ProbeError> {
        Ok(Shape::Int(i64::from(v)))
    }

    fn serialize_u32(self, v: u32) -> Result<Shape, ProbeError> {
        Ok(Shape::Int(i64::from(v)))
    }

    fn serialize_u64(self, v: u64) -> Result<Shape, ProbeError> {
        // Reinterpreted, not clamped: values above i64::MAX come out negative.
        Ok(Shape::Int(v as i64))
    }

    fn serialize_u128(self, v: u128) -> Result<Shape, ProbeError> {
        Ok(Shape::Int(v as i64))
    }

    fn serialize_f32(self, v: f32) -> Result<Shape, ProbeError> {
        Ok(Shape::Float(f64::from(v)))
    }

    fn serialize_f64(self, v: f64) -> Result<Shape, ProbeError> {
        Ok(Shape::Float(v))
    }

    fn serialize_char(self, v: char) -> Result<Shape, ProbeError> {
        Ok(Shape::Str(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<Shape, ProbeError> {
        Ok(Shape::Str(v.to_owned()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Shape, ProbeError> {
        Ok(Shape::Blob(v.to_vec()))
    }

    fn serialize_none(self) -> Result<Shape, ProbeError> {
        Ok(Shape::Null)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<Shape, ProbeError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Shape, ProbeError> {
        Ok(Shape::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Shape, ProbeError> {
        Ok(Shape::UnitStruct)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Shape, ProbeError> {
        Ok(Shape::Rendered(variant.to_owned()))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Shape, ProbeError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<Shape, ProbeError> {
        Ok(Shape::Record)
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqProbe, ProbeError> {
        Ok(SeqProbe::new(len))
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqProbe, ProbeError> {
        Ok(SeqProbe::new(Some(len)))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Skip, ProbeError> {
        Ok(Skip(Shape::Record))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Skip, ProbeError> {
        Ok(Skip(Shape::Record))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Skip, ProbeError> {
        Ok(Skip(Shape::Map))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Skip, ProbeError> {
        Ok(Skip(Shape::Record))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Skip, ProbeError> {
        Ok(Skip(Shape::Record))
    }

    fn collect_str<T: ?Sized + fmt::Display>(self, value: &T) -> Result<Shape, ProbeError> {
        Ok(Shape::Rendered(value.to_string()))
    }
}

/// Watches sequence elements for the all-`u8` case.
pub(crate) struct SeqProbe {
    bytes: Option<Vec<u8>>,
}

impl SeqProbe {
    fn new(len: Option<usize>) -> Self {
        Self {
            bytes: Some(Vec::with_capacity(len.unwrap_or(0))),
        }
    }

    fn element<T: ?Sized + Serialize>(&mut self, value: &T) {
        if let Some(bytes) = self.bytes.as_mut() {
            match value.serialize(ByteProbe) {
                Ok(b) => bytes.push(b),
                Err(_) => self.bytes = None,
            }
        }
    }

    fn finish(self) -> Shape {
        match self.bytes {
            Some(bytes) if !bytes.is_empty() => Shape::Blob(bytes),
            _ => Shape::Seq,
        }
    }
}

impl ser::SerializeSeq for SeqProbe {
    type Ok = Shape;
    type Error = ProbeError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ProbeError> {
        self.element(value);
        Ok(())
    }

    fn end(self) -> Result<Shape, ProbeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for SeqProbe {
    type Ok = Shape;
    type Error = ProbeError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ProbeError> {
        self.element(value);
        Ok(())
    }

    fn end(self) -> Result<Shape, ProbeError> {
        Ok(self.finish())
    }
}

/// Accepts a bare `u8` and nothing else. Options, newtypes and every other
/// shape are refused, so only raw binary sequences qualify as blobs.
struct ByteProbe;

macro_rules! refuse {
    ($($method:ident($($arg:ty),*)),+ $(,)?) => {
        $(
            fn $method(self, $(_: $arg),*) -> Result<u8, ProbeError> {
                Err(ProbeError(String::from("not a byte")))
            }
        )+
    };
}

impl ser::Serializer for ByteProbe {
    type Ok = u8;
    type Error = ProbeError;

    type SerializeSeq = ser::Impossible<u8, ProbeError>;
    type SerializeTuple = ser::Impossible<u8, ProbeError>;
    type SerializeTupleStruct = ser::Impossible<u8, ProbeError>;
    type SerializeTupleVariant = ser::Impossible<u8, ProbeError>;
    type SerializeMap = ser::Impossible<u8, ProbeError>;
    type SerializeStruct = ser::Impossible<u8, ProbeError>;
    type SerializeStructVariant = ser::Impossible<u8, ProbeError>;

    fn serialize_u8(self, v: u8) -> Result<u8, ProbeError> {
        Ok(v)
    }

    refuse! {
        serialize_bool(bool),
        serialize_i8(i8),
        serialize_i16(i16),
        serialize_i32(i32),
        serialize_i64(i64),
        serialize_i128(i128),
        serialize_u16(u16),
        serialize_u32(u32),
        serialize_u64(u64),
        serialize_u128(u128),
        serialize_f32(f32),
        serialize_f64(f64),
        serialize_char(char),
        serialize_str(&str),
        serialize_bytes(&[u8]),
        serialize_none(),
        serialize_unit(),
        serialize_unit_struct(&'static str),
        serialize_unit_variant(&'static str, u32, &'static str),
    }

    fn serialize_some<T: ?Sized + Serialize>(self, _value: &T) -> Result<u8, ProbeError> {
        Err(ProbeError(String::from("not a byte")))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _value: &T,
    ) -> Result<u8, ProbeError> {
        Err(ProbeError(String::from("not a byte")))
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<u8, ProbeError> {
        Err(ProbeError(String::from("not a byte")))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, ProbeError> {
        Err(ProbeError(String::from("not a byte")))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, ProbeError> {
        Err(ProbeError(String::from("not a byte")))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, ProbeError> {
        Err(ProbeError(String::from("not a byte")))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, ProbeError> {
        Err(ProbeError(String::from("not a byte")))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, ProbeError> {
        Err(ProbeError(String::from("not a byte")))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, ProbeError> {
        Err(ProbeError(String::from("not a byte")))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, ProbeError> {
        Err(ProbeError(String::from("not a byte")))
    }

    fn collect_str<T: ?Sized + fmt::Display>(self, _value: &T) -> Result<u8, ProbeError> {
        Err(ProbeError(String::from("not a byte")))
    }
}

/// Ignores the contents of a compound value and reports a fixed shape.
pub(crate) struct Skip(Shape);

impl ser::SerializeTupleStruct for Skip {
    type Ok = Shape;
    type Error = ProbeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, _value: &T) -> Result<(), ProbeError> {
        Ok(())
    }

    fn end(self) -> Result<Shape, ProbeError> {
        Ok(self.0)
    }
}

impl ser::SerializeTupleVariant for Skip {
    type Ok = Shape;
    type Error = ProbeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, _value: &T) -> Result<(), ProbeError> {
        Ok(())
    }

    fn end(self) -> Result<Shape, ProbeError> {
        Ok(self.0)
    }
}

impl ser::SerializeMap for Skip {
    type Ok = Shape;
    type Error = ProbeError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, _key: &T) -> Result<(), ProbeError> {
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, _value: &T) -> Result<(), ProbeError> {
        Ok(())
    }

    fn end(self) -> Result<Shape, ProbeError> {
        Ok(self.0)
    }
}

impl ser::SerializeStruct for Skip {
    type Ok = Shape;
    type Error = ProbeError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        _value: &T,
    ) -> Result<(), ProbeError> {
        Ok(())
    }

    fn end(self) -> Result<Shape, ProbeError> {
        Ok(self.0)
    }
}

impl ser::SerializeStructVariant for Skip {
    type Ok = Shape;
    type Error = ProbeError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        _value: &T,
    ) -> Result<(), ProbeError> {
        Ok(())
    }

    fn end(self) -> Result<Shape, ProbeError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Marker;

    #[derive(Serialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[derive(Serialize)]
    struct Meters(f64);

    #[derive(Serialize)]
    enum Status {
        Active,
        Moved { to: String },
    }

    #[test]
    fn scalars() {
        assert_eq!(shape_of(&true), Ok(Shape::Bool(true)));
        assert_eq!(shape_of(&-5i8), Ok(Shape::Int(-5)));
        assert_eq!(shape_of(&7u8), Ok(Shape::Byte(7)));
        assert_eq!(shape_of(&1.5f32), Ok(Shape::Float(1.5)));
        assert_eq!(shape_of(&'x'), Ok(Shape::Str("x".into())));
        assert_eq!(shape_of("hi"), Ok(Shape::Str("hi".into())));
        assert_eq!(shape_of(&None::<i32>), Ok(Shape::Null));
        assert_eq!(shape_of(&Some(3i64)), Ok(Shape::Int(3)));
        assert_eq!(shape_of(&()), Ok(Shape::Null));
    }

    #[test]
    fn large_unsigned_is_reinterpreted() {
        assert_eq!(shape_of(&u64::MAX), Ok(Shape::Int(-1)));
    }

    #[test]
    fn byte_sequences_become_blobs() {
        assert_eq!(shape_of(&vec![1u8, 2, 3]), Ok(Shape::Blob(vec![1, 2, 3])));
        assert_eq!(shape_of(&[9u8, 8]), Ok(Shape::Blob(vec![9, 8])));
        assert_eq!(shape_of(&Vec::<u8>::new()), Ok(Shape::Seq));
        assert_eq!(shape_of(&vec![1u16, 2]), Ok(Shape::Seq));
        assert_eq!(shape_of(&(1u8, "a")), Ok(Shape::Seq));
    }

    #[test]
    fn optional_bytes_are_not_blobs() {
        assert_eq!(shape_of(&vec![Some(1u8), Some(2u8)]), Ok(Shape::Seq));
        assert_eq!(shape_of(&vec![Some(1u8), None]), Ok(Shape::Seq));
        assert_eq!(shape_of(&Some(vec![4u8, 5])), Ok(Shape::Blob(vec![4, 5])));
    }

    #[test]
    fn compound_values() {
        let mut map = BTreeMap::new();
        map.insert("a", 1);
        assert_eq!(shape_of(&map), Ok(Shape::Map));
        assert_eq!(shape_of(&Point { x: 1, y: 2 }), Ok(Shape::Record));
        assert_eq!(shape_of(&Meters(2.0)), Ok(Shape::Float(2.0)));
        assert_eq!(shape_of(&Marker), Ok(Shape::UnitStruct));
        assert_eq!(
            shape_of(&Status::Active),
            Ok(Shape::Rendered("Active".into()))
        );
        assert_eq!(
            shape_of(&Status::Moved { to: "x".into() }),
            Ok(Shape::Record)
        );
    }

    #[test]
    fn collect_str_is_rendered() {
        struct Shown;
        impl Serialize for Shown {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.collect_str("shown")
            }
        }
        assert_eq!(shape_of(&Shown), Ok(Shape::Rendered("shown".into())));
    }

    #[test]
    fn failing_serialize_reports_message() {
        struct Refuses;
        impl Serialize for Refuses {
            fn serialize<S: serde::Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("not today"))
            }
        }
        assert_eq!(shape_of(&Refuses), Err("not today".to_string()));
    }
}
