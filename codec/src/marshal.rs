//! The generic schema walker: one encoder and one decoder for every record.

use alloc::vec::Vec;

use crate::schema::{FieldDef, FieldKind, StructDef, Value};
use crate::MarshalError;

/// A dynamic record: ordered field name → value pairs.
///
/// Records are small (a dozen fields), so lookup is a linear scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(&'static str, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Record { fields: Vec::new() }
    }

    /// Set a field, replacing any existing value under the same name.
    pub fn set(&mut self, name: &'static str, value: Value) -> &mut Self {
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Encode `record` into `buf` at `offset` following `def`.
///
/// Fields absent from the record (pads, reserved words) encode as zeroes.
/// Any individual field failure aborts the whole record with that field's
/// error; nothing partial is reported as success.
///
/// Returns the number of bytes written, which always equals
/// `def.byte_len()` on success.
pub fn marshal(
    buf: &mut [u8],
    offset: usize,
    record: &Record,
    def: &StructDef,
) -> Result<usize, MarshalError> {
    let mut pos = offset;
    for field in def.fields {
        let flen = field.byte_len();
        if pos + flen > buf.len() {
            return Err(MarshalError::BufferTooSmall {
                field: field.name,
                needed: pos + flen,
                have: buf.len(),
            });
        }
        match record.get(field.name) {
            None => buf[pos..pos + flen].fill(0),
            Some(value) if field.count == 1 => {
                write_one(field, value, &mut buf[pos..pos + flen])?;
            }
            Some(Value::Repeat(values)) => {
                if values.len() != field.count {
                    return Err(MarshalError::TypeMismatch { field: field.name });
                }
                let width = field.kind.width();
                for (i, value) in values.iter().enumerate() {
                    let at = pos + i * width;
                    write_one(field, value, &mut buf[at..at + width])?;
                }
            }
            Some(_) => return Err(MarshalError::TypeMismatch { field: field.name }),
        }
        pos += flen;
    }
    Ok(pos - offset)
}

/// Decode one record from `buf` at `offset` following `def`.
///
/// Returns the record and the number of bytes read.
pub fn unmarshal(
    buf: &[u8],
    offset: usize,
    def: &StructDef,
) -> Result<(Record, usize), MarshalError> {
    let mut record = Record::new();
    let mut pos = offset;
    for field in def.fields {
        let flen = field.byte_len();
        if pos + flen > buf.len() {
            return Err(MarshalError::BufferTooSmall {
                field: field.name,
                needed: pos + flen,
                have: buf.len(),
            });
        }
        if field.count == 1 {
            let value = read_one(field, &buf[pos..pos + flen])?;
            record.set(field.name, value);
        } else {
            let width = field.kind.width();
            let mut values = Vec::with_capacity(field.count);
            for i in 0..field.count {
                let at = pos + i * width;
                values.push(read_one(field, &buf[at..at + width])?);
            }
            record.set(field.name, Value::Repeat(values));
        }
        pos += flen;
    }
    Ok((record, pos - offset))
}

/// True when every byte of `view` is zero. Used to distinguish an omitted
/// optional result from a populated one.
pub fn is_zero(view: &[u8]) -> bool {
    view.iter().all(|&b| b == 0)
}

fn write_one(field: &FieldDef, value: &Value, dst: &mut [u8]) -> Result<(), MarshalError> {
    match (field.kind, value) {
        (FieldKind::U8, Value::U8(v)) => dst[0] = *v,
        (FieldKind::I8, Value::I8(v)) => dst[0] = *v as u8,
        (FieldKind::U16, Value::U16(v)) => dst.copy_from_slice(&v.to_le_bytes()),
        (FieldKind::I16, Value::I16(v)) => dst.copy_from_slice(&v.to_le_bytes()),
        (FieldKind::U32, Value::U32(v)) => dst.copy_from_slice(&v.to_le_bytes()),
        (FieldKind::I32, Value::I32(v)) => dst.copy_from_slice(&v.to_le_bytes()),
        (FieldKind::U64, Value::U64(v)) => dst.copy_from_slice(&v.to_le_bytes()),
        (FieldKind::I64, Value::I64(v)) => dst.copy_from_slice(&v.to_le_bytes()),
        (FieldKind::F32, Value::F32(v)) => dst.copy_from_slice(&v.to_le_bytes()),
        (FieldKind::F64, Value::F64(v)) => dst.copy_from_slice(&v.to_le_bytes()),
        (FieldKind::Custom { marshal, .. }, v) => {
            marshal(v, dst).map_err(|reason| MarshalError::Custom {
                field: field.name,
                reason,
            })?;
        }
        _ => return Err(MarshalError::TypeMismatch { field: field.name }),
    }
    Ok(())
}

fn read_one(field: &FieldDef, src: &[u8]) -> Result<Value, MarshalError> {
    let value = match field.kind {
        FieldKind::U8 => Value::U8(src[0]),
        FieldKind::I8 => Value::I8(src[0] as i8),
        FieldKind::U16 => Value::U16(u16::from_le_bytes([src[0], src[1]])),
        FieldKind::I16 => Value::I16(i16::from_le_bytes([src[0], src[1]])),
        FieldKind::U32 => Value::U32(u32::from_le_bytes([src[0], src[1], src[2], src[3]])),
        FieldKind::I32 => Value::I32(i32::from_le_bytes([src[0], src[1], src[2], src[3]])),
        FieldKind::U64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(src);
            Value::U64(u64::from_le_bytes(b))
        }
        FieldKind::I64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(src);
            Value::I64(i64::from_le_bytes(b))
        }
        FieldKind::F32 => Value::F32(f32::from_le_bytes([src[0], src[1], src[2], src[3]])),
        FieldKind::F64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(src);
            Value::F64(f64::from_le_bytes(b))
        }
        FieldKind::Custom { unmarshal, .. } => {
            unmarshal(src).map_err(|reason| MarshalError::Custom {
                field: field.name,
                reason,
            })?
        }
    };
    Ok(value)
}
