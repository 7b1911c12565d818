//! The POSIX-like record layouts carried across the shared syscall region:
//! `stat` and `dirent`, plus typed views over their decoded records.

use alloc::string::{String, ToString};

use crate::marshal::{marshal, unmarshal, Record};
use crate::schema::{FieldDef, FieldKind, StructDef, Timespec, Value};
use crate::MarshalError;

/// Fixed on-wire length of one stat record.
pub const STAT_LEN: usize = 144;

/// Fixed on-wire length of one dirent record.
pub const DIRENT_LEN: usize = 275;

/// NUL-padded capacity of the dirent name field.
pub const DIRENT_NAME_LEN: usize = 256;

/// File mode bits, as the controller reports them in `stat.mode`.
pub mod mode {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFSOCK: u32 = 0o140000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;
}

const TIMESPEC_LEN: usize = 16;

fn timespec_marshal(value: &Value, dst: &mut [u8]) -> Result<(), String> {
    let ts = match value {
        Value::Timespec(ts) => *ts,
        other => return Err(alloc::format!("expected timespec, got {:?}", other)),
    };
    dst[..8].copy_from_slice(&ts.sec.to_le_bytes());
    dst[8..].copy_from_slice(&ts.nsec.to_le_bytes());
    Ok(())
}

fn timespec_unmarshal(src: &[u8]) -> Result<Value, String> {
    let mut sec = [0u8; 8];
    let mut nsec = [0u8; 8];
    sec.copy_from_slice(&src[..8]);
    nsec.copy_from_slice(&src[8..]);
    Ok(Value::Timespec(Timespec {
        sec: i64::from_le_bytes(sec),
        nsec: i64::from_le_bytes(nsec),
    }))
}

const TIMESPEC: FieldKind = FieldKind::Custom {
    marshal: timespec_marshal,
    unmarshal: timespec_unmarshal,
    len: TIMESPEC_LEN,
};

fn name_marshal(value: &Value, dst: &mut [u8]) -> Result<(), String> {
    let name = match value {
        Value::Name(s) => s,
        other => return Err(alloc::format!("expected name, got {:?}", other)),
    };
    let bytes = name.as_bytes();
    // One byte is reserved for the terminating NUL.
    if bytes.len() >= dst.len() {
        return Err(alloc::format!(
            "name of {} bytes does not fit in {}",
            bytes.len(),
            dst.len()
        ));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    dst[bytes.len()..].fill(0);
    Ok(())
}

fn name_unmarshal(src: &[u8]) -> Result<Value, String> {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    let s = core::str::from_utf8(&src[..end]).map_err(|e| e.to_string())?;
    Ok(Value::Name(s.into()))
}

const NAME: FieldKind = FieldKind::Custom {
    marshal: name_marshal,
    unmarshal: name_unmarshal,
    len: DIRENT_NAME_LEN,
};

/// The 144-byte stat layout (64-bit struct stat, explicit pads and reserved
/// words included).
pub static STAT_DEF: StructDef = StructDef {
    name: "stat",
    fields: &[
        FieldDef::new("dev", FieldKind::U64),
        FieldDef::new("ino", FieldKind::U64),
        FieldDef::new("nlink", FieldKind::U64),
        FieldDef::new("mode", FieldKind::U32),
        FieldDef::new("uid", FieldKind::U32),
        FieldDef::new("gid", FieldKind::U32),
        FieldDef::new("__pad0", FieldKind::U32),
        FieldDef::new("rdev", FieldKind::U64),
        FieldDef::new("size", FieldKind::I64),
        FieldDef::new("blksize", FieldKind::I64),
        FieldDef::new("blocks", FieldKind::I64),
        FieldDef::new("atime", TIMESPEC),
        FieldDef::new("mtime", TIMESPEC),
        FieldDef::new("ctime", TIMESPEC),
        FieldDef::repeated("__unused", FieldKind::I64, 3),
    ],
};

/// The 275-byte dirent layout with a NUL-padded name.
pub static DIRENT_DEF: StructDef = StructDef {
    name: "dirent",
    fields: &[
        FieldDef::new("ino", FieldKind::U64),
        FieldDef::new("off", FieldKind::U64),
        FieldDef::new("reclen", FieldKind::U16),
        FieldDef::new("type", FieldKind::U8),
        FieldDef::new("name", NAME),
    ],
};

/// Typed view of a decoded stat record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl Stat {
    /// Decode a stat record out of `buf` at `offset`.
    pub fn unmarshal(buf: &[u8], offset: usize) -> Result<Stat, MarshalError> {
        let (record, read) = unmarshal(buf, offset, &STAT_DEF)?;
        if read != STAT_LEN {
            return Err(MarshalError::LengthMismatch {
                expected: STAT_LEN,
                actual: read,
            });
        }
        Stat::from_record(&record)
    }

    /// Encode this stat into `buf` at `offset`.
    pub fn marshal(&self, buf: &mut [u8], offset: usize) -> Result<usize, MarshalError> {
        let written = marshal(buf, offset, &self.to_record(), &STAT_DEF)?;
        if written != STAT_LEN {
            return Err(MarshalError::LengthMismatch {
                expected: STAT_LEN,
                actual: written,
            });
        }
        Ok(written)
    }

    pub fn from_record(record: &Record) -> Result<Stat, MarshalError> {
        Ok(Stat {
            dev: get_u64(record, "dev")?,
            ino: get_u64(record, "ino")?,
            nlink: get_u64(record, "nlink")?,
            mode: get_u32(record, "mode")?,
            uid: get_u32(record, "uid")?,
            gid: get_u32(record, "gid")?,
            rdev: get_u64(record, "rdev")?,
            size: get_i64(record, "size")?,
            blksize: get_i64(record, "blksize")?,
            blocks: get_i64(record, "blocks")?,
            atime: get_timespec(record, "atime")?,
            mtime: get_timespec(record, "mtime")?,
            ctime: get_timespec(record, "ctime")?,
        })
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record
            .set("dev", Value::U64(self.dev))
            .set("ino", Value::U64(self.ino))
            .set("nlink", Value::U64(self.nlink))
            .set("mode", Value::U32(self.mode))
            .set("uid", Value::U32(self.uid))
            .set("gid", Value::U32(self.gid))
            .set("rdev", Value::U64(self.rdev))
            .set("size", Value::I64(self.size))
            .set("blksize", Value::I64(self.blksize))
            .set("blocks", Value::I64(self.blocks))
            .set("atime", Value::Timespec(self.atime))
            .set("mtime", Value::Timespec(self.mtime))
            .set("ctime", Value::Timespec(self.ctime));
        record
    }

    /// The `S_IFMT` bits of the mode.
    pub fn filetype(&self) -> u32 {
        self.mode & mode::S_IFMT
    }

    pub fn is_file(&self) -> bool {
        self.filetype() == mode::S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.filetype() == mode::S_IFDIR
    }

    pub fn is_char_device(&self) -> bool {
        self.filetype() == mode::S_IFCHR
    }

    pub fn is_block_device(&self) -> bool {
        self.filetype() == mode::S_IFBLK
    }

    pub fn is_symlink(&self) -> bool {
        self.filetype() == mode::S_IFLNK
    }

    pub fn is_fifo(&self) -> bool {
        self.filetype() == mode::S_IFIFO
    }

    pub fn is_socket(&self) -> bool {
        self.filetype() == mode::S_IFSOCK
    }

    /// Best-effort birth time: the oldest of atime, mtime and ctime. The
    /// controller does not report a true birth time.
    pub fn birthtime(&self) -> Timespec {
        let mut oldest = self.atime;
        if self.mtime < oldest {
            oldest = self.mtime;
        }
        if self.ctime < oldest {
            oldest = self.ctime;
        }
        oldest
    }
}

/// Typed view of a decoded dirent record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u64,
    pub off: u64,
    pub reclen: u16,
    pub kind: u8,
    pub name: String,
}

impl Dirent {
    pub fn unmarshal(buf: &[u8], offset: usize) -> Result<Dirent, MarshalError> {
        let (record, read) = unmarshal(buf, offset, &DIRENT_DEF)?;
        if read != DIRENT_LEN {
            return Err(MarshalError::LengthMismatch {
                expected: DIRENT_LEN,
                actual: read,
            });
        }
        Ok(Dirent {
            ino: get_u64(&record, "ino")?,
            off: get_u64(&record, "off")?,
            reclen: get_u16(&record, "reclen")?,
            kind: get_u8(&record, "type")?,
            name: get_name(&record, "name")?,
        })
    }

    pub fn marshal(&self, buf: &mut [u8], offset: usize) -> Result<usize, MarshalError> {
        let mut record = Record::new();
        record
            .set("ino", Value::U64(self.ino))
            .set("off", Value::U64(self.off))
            .set("reclen", Value::U16(self.reclen))
            .set("type", Value::U8(self.kind))
            .set("name", Value::Name(self.name.clone()));
        let written = marshal(buf, offset, &record, &DIRENT_DEF)?;
        if written != DIRENT_LEN {
            return Err(MarshalError::LengthMismatch {
                expected: DIRENT_LEN,
                actual: written,
            });
        }
        Ok(written)
    }
}

fn get_u8(record: &Record, name: &'static str) -> Result<u8, MarshalError> {
    match record.get(name) {
        Some(Value::U8(v)) => Ok(*v),
        _ => Err(MarshalError::TypeMismatch { field: name }),
    }
}

fn get_u16(record: &Record, name: &'static str) -> Result<u16, MarshalError> {
    match record.get(name) {
        Some(Value::U16(v)) => Ok(*v),
        _ => Err(MarshalError::TypeMismatch { field: name }),
    }
}

fn get_u32(record: &Record, name: &'static str) -> Result<u32, MarshalError> {
    match record.get(name) {
        Some(Value::U32(v)) => Ok(*v),
        _ => Err(MarshalError::TypeMismatch { field: name }),
    }
}

fn get_u64(record: &Record, name: &'static str) -> Result<u64, MarshalError> {
    match record.get(name) {
        Some(Value::U64(v)) => Ok(*v),
        _ => Err(MarshalError::TypeMismatch { field: name }),
    }
}

fn get_i64(record: &Record, name: &'static str) -> Result<i64, MarshalError> {
    match record.get(name) {
        Some(Value::I64(v)) => Ok(*v),
        _ => Err(MarshalError::TypeMismatch { field: name }),
    }
}

fn get_timespec(record: &Record, name: &'static str) -> Result<Timespec, MarshalError> {
    match record.get(name) {
        Some(Value::Timespec(v)) => Ok(*v),
        _ => Err(MarshalError::TypeMismatch { field: name }),
    }
}

fn get_name(record: &Record, name: &'static str) -> Result<String, MarshalError> {
    match record.get(name) {
        Some(Value::Name(v)) => Ok(v.clone()),
        _ => Err(MarshalError::TypeMismatch { field: name }),
    }
}
