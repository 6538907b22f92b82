//! Helpers for building SQL text.

/// Returns `count` positional placeholders separated by commas.
///
/// ```
/// assert_eq!(cellar_db::placeholders(3), "?, ?, ?");
/// assert_eq!(cellar_db::placeholders(0), "");
/// ```
pub fn placeholders(count: usize) -> String {
    let mut sql = String::with_capacity(count.saturating_mul(3));
    push_placeholders(count, &mut sql);
    sql
}

/// Returns `rows` parenthesised groups of `cols` placeholders, as used by
/// multi-row `INSERT ... VALUES`.
///
/// ```
/// assert_eq!(cellar_db::group_placeholders(2, 3), "(?, ?, ?), (?, ?, ?)");
/// ```
pub fn group_placeholders(rows: usize, cols: usize) -> String {
    let mut sql = String::new();
    push_group_placeholders(rows, cols, &mut sql);
    sql
}

/// Appends the output of [`group_placeholders`] to an existing buffer.
pub fn push_group_placeholders(rows: usize, cols: usize, sql: &mut String) {
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        push_placeholders(cols, sql);
        sql.push(')');
    }
}

fn push_placeholders(count: usize, sql: &mut String) {
    for i in 0..count {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push('?');
    }
}

/// Quotes an identifier (table, savepoint) for interpolation into SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for ch in name.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Collapses runs of whitespace for compact log output.
pub(crate) fn compact(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for (i, word) in sql.split_whitespace().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}
