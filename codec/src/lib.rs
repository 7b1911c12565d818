//! Binary struct marshaling for the tether worker.
//!
//! This crate encodes and decodes fixed-layout records (stat, dirent) over
//! raw byte buffers such as the worker's shared syscall region. A record
//! layout is described by a [`StructDef`]: an ordered list of named fields,
//! each a fixed-width little-endian primitive or a custom codec pair, with an
//! optional repeat count. One generic walker interprets the schema in both
//! directions; there is no per-record serialization code.
//!
//! Field order and width in a schema are the source-of-truth layout. No
//! padding or alignment is ever computed; reserved and pad bytes appear as
//! explicit fields.

#![no_std]

extern crate alloc;

pub mod records;
pub mod schema;

mod marshal;

pub use marshal::{is_zero, marshal, unmarshal, Record};
pub use schema::{FieldDef, FieldKind, StructDef, Timespec, Value};

use alloc::string::String;

/// Marshaling error. Returned as a value, never panicked, so callers decide
/// severity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    /// Buffer cannot hold the field at its offset.
    BufferTooSmall {
        field: &'static str,
        needed: usize,
        have: usize,
    },
    /// Record value does not match the field's schema kind.
    TypeMismatch { field: &'static str },
    /// Encoded length differs from the schema's fixed length.
    LengthMismatch { expected: usize, actual: usize },
    /// A custom codec rejected its input.
    Custom { field: &'static str, reason: String },
}

impl core::fmt::Display for MarshalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MarshalError::BufferTooSmall {
                field,
                needed,
                have,
            } => write!(
                f,
                "buffer too small for field '{}': need {} bytes, have {}",
                field, needed, have
            ),
            MarshalError::TypeMismatch { field } => {
                write!(f, "value type does not match schema for field '{}'", field)
            }
            MarshalError::LengthMismatch { expected, actual } => {
                write!(f, "encoded length {} != schema length {}", actual, expected)
            }
            MarshalError::Custom { field, reason } => {
                write!(f, "custom codec failed for field '{}': {}", field, reason)
            }
        }
    }
}
