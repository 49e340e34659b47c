//! Typed statement parameters and placeholder substitution.
//!
//! A prepared template may contain `?` placeholders (escape a literal one
//! as `\?`). Each placeholder takes the value bound in the matching slot,
//! rendered in the form the server parses for its type; an unbound slot
//! renders as the language's NIL literal.

use crate::protocol::PLACEHOLDER;
use crate::protocol::fields::quote;

/// Calendar date, year may be negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Date {
    pub year: i16,
    pub month: u8,
    pub day: u8,
}

/// Time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Time {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// Date and time with a nanosecond fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub date: Date,
    pub time: Time,
    /// Nanoseconds within the second.
    pub fraction: u32,
}

/// One bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Tiny(i8),
    UTiny(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Float(f32),
    Double(f64),
    Char(char),
    Varchar(String),
    Date(Date),
    Time(Time),
    Timestamp(Timestamp),
    /// Appended verbatim, the caller is responsible for quoting.
    Literal(String),
}

impl Param {
    fn render(&self, lang_is_mal: bool, out: &mut String) {
        match self {
            Param::Null => out.push_str(if lang_is_mal { "nil" } else { "NULL" }),
            Param::Tiny(v) => out.push_str(&v.to_string()),
            Param::UTiny(v) => out.push_str(&v.to_string()),
            Param::Short(v) => out.push_str(&v.to_string()),
            Param::UShort(v) => out.push_str(&v.to_string()),
            Param::Int(v) => out.push_str(&v.to_string()),
            Param::UInt(v) => out.push_str(&v.to_string()),
            Param::Long(v) => out.push_str(&v.to_string()),
            Param::ULong(v) => out.push_str(&v.to_string()),
            Param::Float(v) => out.push_str(&v.to_string()),
            Param::Double(v) => out.push_str(&v.to_string()),
            Param::Char(c) => {
                out.push('\'');
                out.push_str(&quote(&c.to_string()));
                out.push('\'');
            }
            Param::Varchar(s) => {
                out.push('\'');
                out.push_str(&quote(s));
                out.push('\'');
            }
            Param::Date(d) => {
                out.push_str(&format!("DATE '{:04}-{:02}-{:02}'", d.year, d.month, d.day));
            }
            Param::Time(t) => {
                out.push_str(&format!(
                    "TIME '{:02}:{:02}:{:02}'",
                    t.hour, t.minute, t.second
                ));
            }
            Param::Timestamp(ts) => {
                out.push_str(&format!(
                    "TIMESTAMP '{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:09}'",
                    ts.date.year,
                    ts.date.month,
                    ts.date.day,
                    ts.time.hour,
                    ts.time.minute,
                    ts.time.second,
                    ts.fraction
                ));
            }
            Param::Literal(s) => out.push_str(s),
        }
    }
}

/// Materialize a template: each unescaped `?` becomes the rendered value
/// of its slot. Placeholders beyond the last slot stay literal, and `\?`
/// is passed through untouched.
pub fn substitute(template: &str, params: &[Option<Param>], lang_is_mal: bool) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut slot = 0;
    let mut prev = '\0';
    for c in template.chars() {
        if c == PLACEHOLDER && prev != '\\' && slot < params.len() {
            match &params[slot] {
                Some(param) => param.render(lang_is_mal, &mut out),
                None => out.push_str(if lang_is_mal { "nil" } else { "NULL" }),
            }
            slot += 1;
        } else {
            out.push(c);
        }
        prev = c;
    }
    out
}
