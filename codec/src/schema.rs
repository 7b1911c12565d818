//! Record schemas: field kinds, field lists, and the values they carry.

use alloc::string::String;
use alloc::vec::Vec;

/// Custom field encoder. Receives exactly `len` bytes of destination.
pub type CustomMarshal = fn(&Value, &mut [u8]) -> Result<(), String>;

/// Custom field decoder. Receives exactly `len` bytes of source.
pub type CustomUnmarshal = fn(&[u8]) -> Result<Value, String>;

/// A seconds + nanoseconds pair, the payload of the timespec custom codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Timespec { sec, nsec }
    }

    /// Total nanoseconds, saturating on overflow.
    pub fn as_nanos(&self) -> u64 {
        let sec = if self.sec < 0 { 0 } else { self.sec as u64 };
        let nsec = if self.nsec < 0 { 0 } else { self.nsec as u64 };
        sec.saturating_mul(1_000_000_000).saturating_add(nsec)
    }
}

/// A decoded or to-be-encoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Payload of the timespec custom codec.
    Timespec(Timespec),
    /// Payload of the NUL-padded name custom codec.
    Name(String),
    /// A repeated field (`FieldDef::count > 1`), one value per repetition.
    Repeat(Vec<Value>),
}

/// Field kind: a built-in fixed-width primitive (little-endian) or a custom
/// codec pair with a fixed byte length.
///
/// Custom codecs are plain function pointers, not trait objects.
#[derive(Clone, Copy)]
pub enum FieldKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Custom {
        marshal: CustomMarshal,
        unmarshal: CustomUnmarshal,
        len: usize,
    },
}

impl FieldKind {
    /// Encoded width of one value of this kind.
    pub const fn width(&self) -> usize {
        match self {
            FieldKind::U8 | FieldKind::I8 => 1,
            FieldKind::U16 | FieldKind::I16 => 2,
            FieldKind::U32 | FieldKind::I32 | FieldKind::F32 => 4,
            FieldKind::U64 | FieldKind::I64 | FieldKind::F64 => 8,
            FieldKind::Custom { len, .. } => *len,
        }
    }
}

impl core::fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FieldKind::U8 => write!(f, "U8"),
            FieldKind::I8 => write!(f, "I8"),
            FieldKind::U16 => write!(f, "U16"),
            FieldKind::I16 => write!(f, "I16"),
            FieldKind::U32 => write!(f, "U32"),
            FieldKind::I32 => write!(f, "I32"),
            FieldKind::U64 => write!(f, "U64"),
            FieldKind::I64 => write!(f, "I64"),
            FieldKind::F32 => write!(f, "F32"),
            FieldKind::F64 => write!(f, "F64"),
            FieldKind::Custom { len, .. } => write!(f, "Custom({} bytes)", len),
        }
    }
}

/// One named field in a record layout.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Number of consecutive repetitions. 1 for ordinary fields.
    pub count: usize,
}

impl FieldDef {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        FieldDef {
            name,
            kind,
            count: 1,
        }
    }

    pub const fn repeated(name: &'static str, kind: FieldKind, count: usize) -> Self {
        FieldDef { name, kind, count }
    }

    /// Encoded width of the whole field including repetitions.
    pub const fn byte_len(&self) -> usize {
        self.kind.width() * self.count
    }
}

/// An ordered record layout.
///
/// The field list is the layout: widths are taken from the kinds, offsets
/// from the order. The "natural alignment" of the underlying C struct is
/// documentation only and never computed; explicit pad fields carry it.
#[derive(Debug, Clone, Copy)]
pub struct StructDef {
    pub name: &'static str,
    pub fields: &'static [FieldDef],
}

impl StructDef {
    /// Total encoded length of one record.
    pub fn byte_len(&self) -> usize {
        self.fields.iter().map(|f| f.byte_len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_widths() {
        assert_eq!(FieldKind::U8.width(), 1);
        assert_eq!(FieldKind::I16.width(), 2);
        assert_eq!(FieldKind::U32.width(), 4);
        assert_eq!(FieldKind::I64.width(), 8);
        assert_eq!(FieldKind::F64.width(), 8);
    }

    #[test]
    fn test_repeated_field_len() {
        let f = FieldDef::repeated("reserved", FieldKind::I64, 3);
        assert_eq!(f.byte_len(), 24);
    }

    #[test]
    fn test_timespec_ordering() {
        let a = Timespec::new(1, 0);
        let b = Timespec::new(1, 500);
        let c = Timespec::new(2, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_timespec_as_nanos() {
        assert_eq!(Timespec::new(1, 5).as_nanos(), 1_000_000_005);
        assert_eq!(Timespec::new(0, 0).as_nanos(), 0);
    }
}
