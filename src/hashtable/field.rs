//! Key and value fields of a hash table.
//!
//! A [`HashField`] knows how to pull its value out of a raw event record.
//! The extraction function is chosen once, when the field is parsed, from
//! the event field's width and signedness.

use alloc::format;
use alloc::string::{String, ToString};

use super::Error;
use crate::event::{COMMON_PID, EventCall, EventField, FieldType};

/// Fixed-width integer readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
}

impl Scalar {
    /// Reader for a field of `size` bytes.
    pub fn select(size: usize, signed: bool) -> Option<Self> {
        let s = match (size, signed) {
            (1, false) => Scalar::U8,
            (2, false) => Scalar::U16,
            (4, false) => Scalar::U32,
            (8, false) => Scalar::U64,
            (1, true) => Scalar::S8,
            (2, true) => Scalar::S16,
            (4, true) => Scalar::S32,
            (8, true) => Scalar::S64,
            _ => return None,
        };
        Some(s)
    }

    pub fn size(self) -> usize {
        match self {
            Scalar::U8 | Scalar::S8 => 1,
            Scalar::U16 | Scalar::S16 => 2,
            Scalar::U32 | Scalar::S32 => 4,
            Scalar::U64 | Scalar::S64 => 8,
        }
    }

    /// Read at `offset`, sign-extending signed widths. Short records read as 0.
    pub fn read(self, rec: &[u8], offset: usize) -> u64 {
        let Some(b) = offset
            .checked_add(self.size())
            .and_then(|end| rec.get(offset..end))
        else {
            return 0;
        };
        match self {
            Scalar::U8 => b[0] as u64,
            Scalar::S8 => b[0] as i8 as i64 as u64,
            Scalar::U16 => u16::from_ne_bytes([b[0], b[1]]) as u64,
            Scalar::S16 => i16::from_ne_bytes([b[0], b[1]]) as i64 as u64,
            Scalar::U32 => u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as u64,
            Scalar::S32 => i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as i64 as u64,
            Scalar::U64 | Scalar::S64 => {
                u64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
        }
    }
}

/// How a field produces its 64-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFn {
    Scalar(Scalar),
    /// Address of the string within the record.
    String,
    /// First field minus second field, each read at its own width.
    Diff(Scalar, Scalar),
    /// Key is the captured call stack; no record value.
    Stacktrace,
    /// Value supplied by the caller instead of read from a record.
    Override,
}

/// Output format of a key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDisplay {
    Plain,
    Sym,
    Hex,
    /// Only valid on `common_pid`: prints the saved command name.
    Execname,
    Syscall,
}

/// A parsed key or value field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashField {
    name: String,
    field: Option<EventField>,
    aux: Option<EventField>,
    value_fn: ValueFn,
    display: FieldDisplay,
}

impl HashField {
    /// The `stacktrace` key.
    pub fn stacktrace() -> Self {
        Self {
            name: "stacktrace".to_string(),
            field: None,
            aux: None,
            value_fn: ValueFn::Stacktrace,
            display: FieldDisplay::Plain,
        }
    }

    /// A value whose per-hit amount is passed in by the caller.
    pub fn overridden(name: &str) -> Self {
        Self {
            name: name.to_string(),
            field: None,
            aux: None,
            value_fn: ValueFn::Override,
            display: FieldDisplay::Plain,
        }
    }

    /// Wrap an event field.
    pub fn from_event_field(field: &EventField, display: FieldDisplay) -> Result<Self, Error> {
        let value_fn = match field.ty {
            FieldType::Function => return Err(Error::UnsuitableField(field.name.clone())),
            FieldType::String => ValueFn::String,
            FieldType::Integer => ValueFn::Scalar(
                Scalar::select(field.size, field.is_signed)
                    .ok_or_else(|| Error::UnsuitableField(field.name.clone()))?,
            ),
        };
        Ok(Self {
            name: field.name.clone(),
            field: Some(field.clone()),
            aux: None,
            value_fn,
            display,
        })
    }

    /// `minuend - subtrahend`, both integer fields.
    pub fn diff(minuend: &EventField, subtrahend: &EventField) -> Result<Self, Error> {
        let select = |f: &EventField| {
            if f.ty != FieldType::Integer {
                return Err(Error::UnsuitableField(f.name.clone()));
            }
            Scalar::select(f.size, f.is_signed).ok_or_else(|| Error::UnsuitableField(f.name.clone()))
        };
        let a = select(minuend)?;
        let b = select(subtrahend)?;
        Ok(Self {
            name: format!("{}-{}", minuend.name, subtrahend.name),
            field: Some(minuend.clone()),
            aux: Some(subtrahend.clone()),
            value_fn: ValueFn::Diff(a, b),
            display: FieldDisplay::Plain,
        })
    }

    /// Field name as printed, `a-b` for differences.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_fn(&self) -> ValueFn {
        self.value_fn
    }

    pub fn display(&self) -> FieldDisplay {
        self.display
    }

    pub fn field(&self) -> Option<&EventField> {
        self.field.as_ref()
    }

    /// Declared width of the underlying event field, 0 if there is none.
    pub fn size(&self) -> usize {
        self.field.as_ref().map_or(0, |f| f.size)
    }

    pub fn is_string(&self) -> bool {
        self.value_fn == ValueFn::String
    }

    pub fn is_stacktrace(&self) -> bool {
        self.value_fn == ValueFn::Stacktrace
    }

    pub fn is_override(&self) -> bool {
        self.value_fn == ValueFn::Override
    }

    /// Extract this field's value from `rec`.
    pub fn value(&self, rec: &[u8]) -> u64 {
        let offset = self.field.as_ref().map_or(0, |f| f.offset);
        match self.value_fn {
            ValueFn::Scalar(s) => s.read(rec, offset),
            ValueFn::String => self.string_bytes(rec).as_ptr() as usize as u64,
            ValueFn::Diff(a, b) => {
                let aux = self.aux.as_ref().map_or(0, |f| f.offset);
                a.read(rec, offset).wrapping_sub(b.read(rec, aux))
            }
            ValueFn::Stacktrace | ValueFn::Override => 0,
        }
    }

    /// All declared bytes of a string field; empty for other kinds or short records.
    pub fn string_bytes<'a>(&self, rec: &'a [u8]) -> &'a [u8] {
        match &self.field {
            Some(f) if self.is_string() => f.bytes(rec).unwrap_or(&[]),
            _ => &[],
        }
    }
}

/// Split `name.modifier` at the first dot.
fn split_modifier(token: &str) -> (&str, Option<&str>) {
    match token.split_once('.') {
        Some((name, modifier)) => (name, Some(modifier)),
        None => (token, None),
    }
}

fn lookup<'a>(call: Option<&'a EventCall>, name: &str) -> Result<&'a EventField, Error> {
    call.and_then(|c| c.find_field(name))
        .ok_or_else(|| Error::UnknownField(name.to_string()))
}

/// Parse one key token: `stacktrace` or `field[.sym|.hex|.execname|.syscall]`.
///
/// Without an event only `stacktrace` can be resolved.
pub fn parse_key(token: &str, call: Option<&EventCall>) -> Result<HashField, Error> {
    let (name, modifier) = split_modifier(token);
    if name == "stacktrace" {
        return match modifier {
            None => Ok(HashField::stacktrace()),
            Some(m) => Err(Error::InvalidModifier(m.to_string())),
        };
    }

    let field = lookup(call, name)?;
    let display = match modifier {
        None => FieldDisplay::Plain,
        Some("sym") => FieldDisplay::Sym,
        Some("hex") => FieldDisplay::Hex,
        Some("syscall") => FieldDisplay::Syscall,
        Some("execname") if name == COMMON_PID => FieldDisplay::Execname,
        Some(m) => return Err(Error::InvalidModifier(m.to_string())),
    };
    HashField::from_event_field(field, display)
}

/// Parse one value token: `hitcount`, `a-b` or `field[.sym|.hex|.override]`.
///
/// `hitcount` yields `None`: the hit count is always kept.
pub fn parse_val(token: &str, call: Option<&EventCall>) -> Result<Option<HashField>, Error> {
    if token == "hitcount" {
        return Ok(None);
    }

    if let Some((a, b)) = token.split_once('-') {
        let minuend = lookup(call, a)?;
        let subtrahend = lookup(call, b)?;
        return HashField::diff(minuend, subtrahend).map(Some);
    }

    let (name, modifier) = split_modifier(token);
    let display = match modifier {
        None => FieldDisplay::Plain,
        Some("sym") => FieldDisplay::Sym,
        Some("hex") => FieldDisplay::Hex,
        Some("override") => return Ok(Some(HashField::overridden(name))),
        Some(m) => return Err(Error::InvalidModifier(m.to_string())),
    };
    let field = lookup(call, name)?;
    HashField::from_event_field(field, display).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_select_rejects_odd_widths() {
        assert_eq!(Scalar::select(4, true), Some(Scalar::S32));
        assert_eq!(Scalar::select(3, false), None);
        assert_eq!(Scalar::select(16, false), None);
    }

    #[test]
    fn test_scalar_read_short_record_is_zero() {
        assert_eq!(Scalar::U64.read(&[1, 2, 3], 0), 0);
        assert_eq!(Scalar::U8.read(&[1, 2, 3], 2), 3);
        assert_eq!(Scalar::U8.read(&[1], usize::MAX), 0);
    }

    #[test]
    fn test_split_modifier() {
        assert_eq!(split_modifier("call_site.sym"), ("call_site", Some("sym")));
        assert_eq!(split_modifier("bytes_req"), ("bytes_req", None));
    }
}
