//! Filesystem-shaped bindings over the synchronous channel.
//!
//! These are the blocking operations the guest-interface layer expects from
//! a host filesystem: open, close, read, write, fstat and exit. Each one
//! copies its argument bytes into the shared region payload, issues the
//! matching trap and interprets the signed result. All filesystem semantics
//! live on the controller side; nothing here caches or simulates state.

use std::fmt;
use std::sync::Arc;

use tether_codec::records::{Stat, STAT_LEN};
use tether_codec::MarshalError;

use crate::channel::SyscallChannel;
use crate::protocol::Trap;
use crate::region::{RegionError, SharedRegion, PAYLOAD_OFFSET};

/// Open flag bits, as the controller's open trap expects them.
pub mod oflag {
    pub const O_RDONLY: i64 = 0;
    pub const O_WRONLY: i64 = 1;
    pub const O_RDWR: i64 = 2;
    pub const O_CREAT: i64 = 64;
    pub const O_EXCL: i64 = 128;
    pub const O_NOCTTY: i64 = 256;
    pub const O_TRUNC: i64 = 512;
    pub const O_APPEND: i64 = 1024;
    pub const O_NONBLOCK: i64 = 2048;
    pub const O_DSYNC: i64 = 4096;
    pub const O_DIRECTORY: i64 = 65536;
    pub const O_NOFOLLOW: i64 = 131072;
    pub const O_SYNC: i64 = 1052672;
}

/// Errors raised by the binding layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysError {
    /// The controller reported a negative result code.
    Code(i32),
    /// `read_sync` was asked to read at a position the trap cannot express.
    BadPosition { position: i64 },
    /// A successful read returned a byte count other than the one requested.
    /// Partial reads are unsupported, so this is a logic error, never a
    /// value to pass along.
    ShortRead { wanted: usize, got: i32 },
    /// Arguments did not fit the region payload.
    Region(RegionError),
    /// A result record failed to decode.
    Marshal(MarshalError),
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SysError::Code(code) => write!(f, "syscall failed with code {}", code),
            SysError::BadPosition { position } => {
                write!(f, "read at position {} is unsupported", position)
            }
            SysError::ShortRead { wanted, got } => {
                write!(f, "read returned {} of {} requested bytes", got, wanted)
            }
            SysError::Region(e) => write!(f, "region: {}", e),
            SysError::Marshal(e) => write!(f, "marshal: {}", e),
        }
    }
}

impl From<RegionError> for SysError {
    fn from(e: RegionError) -> Self {
        SysError::Region(e)
    }
}

impl From<MarshalError> for SysError {
    fn from(e: MarshalError) -> Self {
        SysError::Marshal(e)
    }
}

/// The POSIX-shaped binding set.
pub struct PosixBinding {
    chan: SyscallChannel,
}

impl PosixBinding {
    pub fn new(chan: SyscallChannel) -> Self {
        PosixBinding { chan }
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        self.chan.region()
    }

    /// Open `path` with the given flag bits; returns the controller-side
    /// descriptor.
    ///
    /// The path travels NUL-terminated at the start of the payload; the trap
    /// arguments are the path's region address and the flags.
    pub fn open_sync(&mut self, path: &str, flags: i64) -> Result<i32, SysError> {
        let region = Arc::clone(self.chan.region());
        region.payload_write(0, path.as_bytes())?;
        region.payload_write(path.len(), &[0])?;
        let result = self
            .chan
            .call_sync(Trap::Open, &[PAYLOAD_OFFSET as i64, flags]);
        if result >= 0 {
            Ok(result)
        } else {
            Err(SysError::Code(result))
        }
    }

    /// Close a controller-side descriptor. Any non-zero result fails the
    /// call.
    pub fn close_sync(&mut self, fd: i32) -> Result<(), SysError> {
        let result = self.chan.call_sync(Trap::Close, &[fd as i64]);
        if result == 0 {
            Ok(())
        } else {
            Err(SysError::Code(result))
        }
    }

    /// Write `buf[offset..offset + length]` to `fd`; returns the byte count
    /// the controller reports.
    ///
    /// `length` defaults to the rest of the buffer. A position is accepted
    /// for signature compatibility but ignored by the write trap.
    pub fn write_sync(
        &mut self,
        fd: i32,
        buf: &[u8],
        offset: usize,
        length: Option<usize>,
        position: Option<i64>,
    ) -> Result<usize, SysError> {
        let length = length.unwrap_or_else(|| buf.len().saturating_sub(offset));
        if let Some(position) = position {
            log::warn!("write position {} is ignored", position);
        }
        let chunk = buf
            .get(offset..offset + length)
            .ok_or(SysError::Region(RegionError::OutOfBounds {
                offset,
                len: length,
                payload: buf.len(),
            }))?;
        let region = Arc::clone(self.chan.region());
        region.payload_write(0, chunk)?;
        let result = self.chan.call_sync(
            Trap::Write,
            &[fd as i64, PAYLOAD_OFFSET as i64, length as i64],
        );
        if result >= 0 {
            Ok(result as usize)
        } else {
            Err(SysError::Code(result))
        }
    }

    /// Read exactly `length` bytes from `fd` into `buf[offset..]`.
    ///
    /// The read trap only fills the region at a fixed address, so a
    /// non-zero `position` is a precondition violation. A successful call
    /// that reads anything other than `length` bytes is an error as well;
    /// there is no way to resume a partial read.
    pub fn read_sync(
        &mut self,
        fd: i32,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: Option<i64>,
    ) -> Result<usize, SysError> {
        let position = position.unwrap_or(0);
        if position != 0 {
            return Err(SysError::BadPosition { position });
        }
        if buf.len() < offset + length {
            return Err(SysError::Region(RegionError::OutOfBounds {
                offset,
                len: length,
                payload: buf.len(),
            }));
        }
        let region = Arc::clone(self.chan.region());
        let result = self.chan.call_sync(
            Trap::Read,
            &[fd as i64, (PAYLOAD_OFFSET + offset) as i64, length as i64],
        );
        if result < 0 {
            return Err(SysError::Code(result));
        }
        if result as usize != length {
            return Err(SysError::ShortRead {
                wanted: length,
                got: result,
            });
        }
        region.payload_read_into(offset, &mut buf[offset..offset + length])?;
        Ok(length)
    }

    /// Stat a controller-side descriptor.
    pub fn fstat_sync(&mut self, fd: i32) -> Result<Stat, SysError> {
        let region = Arc::clone(self.chan.region());
        let result = self.chan.call_sync(Trap::Fstat64, &[fd as i64]);
        if result < 0 {
            return Err(SysError::Code(result));
        }
        let raw = region.payload_read(0, STAT_LEN)?;
        let stat = Stat::unmarshal(&raw, 0)?;
        Ok(stat)
    }

    /// Report process exit to the controller.
    ///
    /// By contract this is only reached from the guest's process-exit
    /// import, whose caller transfers control away once the underlying call
    /// unblocks; the returned success code exists for signature
    /// compatibility.
    pub fn exit(&mut self, code: Option<i32>) -> i32 {
        let code = match code {
            Some(code) => code,
            None => {
                log::warn!("exit called without a code, substituting 0");
                0
            }
        };
        self.chan.call_sync(Trap::Exit, &[code as i64]);
        0
    }
}

/// The miscellaneous bindings the guest-interface layer expects besides the
/// filesystem: a monotonic clock and a tty query.
#[derive(Debug, Clone, Copy, Default)]
pub struct MiscBindings;

impl MiscBindings {
    /// Monotonic nanoseconds. There is no clock trap; reports zero.
    pub fn hrtime(&self) -> u64 {
        0
    }

    /// The standard streams are terminal-like on the controller side.
    pub fn is_tty(&self) -> bool {
        true
    }
}
