//! The guest import surface.
//!
//! Presents the bridged filesystem bindings as the exact function set a
//! compiled guest binary imports, with guest-memory-aware argument decoding:
//! buffer vectors of (pointer, length) pairs, NUL-terminated path strings,
//! and output pointers standing in for additional return values. The host
//! binding model returns at most one value, so every extra result is written
//! through an explicit pointer parameter into guest memory.
//!
//! All file I/O is delegated through [`PosixBinding`]; the shim owns only a
//! descriptor table mapping small guest integers to controller-side
//! descriptors plus filetype, rights and path bookkeeping. Descriptors 0/1/2
//! are pre-populated as character-device-like standard streams.

use std::collections::BTreeMap;
use std::fmt;

use tether_codec::records::{mode, Stat};

use crate::posix::{oflag, MiscBindings, PosixBinding, SysError};

/// Guest-visible error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum WasiErrno {
    /// Success.
    Success = 0,
    /// Argument list too long.
    TooBig = 1,
    /// Permission denied.
    Access = 2,
    /// Resource unavailable.
    Again = 6,
    /// Bad file descriptor.
    BadF = 8,
    /// File exists.
    Exist = 20,
    /// Bad address.
    Fault = 21,
    /// Illegal byte sequence.
    IlSeq = 25,
    /// Invalid argument.
    Inval = 28,
    /// I/O error.
    Io = 29,
    /// Is a directory.
    IsDir = 31,
    /// Filename too long.
    NameTooLong = 37,
    /// No such file or directory.
    NoEnt = 44,
    /// Not enough space.
    NoMem = 48,
    /// No space left on device.
    NoSpc = 51,
    /// Function not supported.
    NoSys = 52,
    /// Not a directory.
    NotDir = 54,
    /// Not supported.
    NotSup = 58,
    /// Value too large to be stored in data type.
    Overflow = 61,
    /// Operation not permitted.
    Perm = 63,
    /// Invalid seek.
    SPipe = 70,
    /// Capabilities insufficient.
    NotCapable = 76,
}

impl WasiErrno {
    /// Convert to the guest-visible errno integer.
    pub fn to_errno(self) -> i32 {
        self as i32
    }

    /// Map a binding-layer failure to the errno the guest sees.
    pub fn from_sys(err: &SysError) -> WasiErrno {
        match err {
            SysError::Code(code) => WasiErrno::from_host_code(*code),
            SysError::BadPosition { .. } => WasiErrno::NotSup,
            SysError::ShortRead { .. } => WasiErrno::Io,
            SysError::Region(_) => WasiErrno::NoMem,
            SysError::Marshal(_) => WasiErrno::Io,
        }
    }

    /// Map a negative controller result code (negated host errno) to a
    /// guest errno.
    pub fn from_host_code(code: i32) -> WasiErrno {
        match -code {
            1 => WasiErrno::Perm,
            2 => WasiErrno::NoEnt,
            9 => WasiErrno::BadF,
            11 => WasiErrno::Again,
            12 => WasiErrno::NoMem,
            13 => WasiErrno::Access,
            17 => WasiErrno::Exist,
            20 => WasiErrno::NotDir,
            21 => WasiErrno::IsDir,
            22 => WasiErrno::Inval,
            28 => WasiErrno::NoSpc,
            36 => WasiErrno::NameTooLong,
            _ => WasiErrno::Io,
        }
    }
}

impl fmt::Display for WasiErrno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", *self as u16)
    }
}

/// Guest file descriptor types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Filetype {
    Unknown = 0,
    BlockDevice = 1,
    CharDevice = 2,
    Directory = 3,
    RegularFile = 4,
    SocketDgram = 5,
    SocketStream = 6,
    SymbolicLink = 7,
}

/// Derive the guest filetype tag from the stat mode bits.
pub fn filetype_from_mode(file_mode: u32) -> Filetype {
    match file_mode & mode::S_IFMT {
        mode::S_IFREG => Filetype::RegularFile,
        mode::S_IFDIR => Filetype::Directory,
        mode::S_IFCHR => Filetype::CharDevice,
        mode::S_IFBLK => Filetype::BlockDevice,
        mode::S_IFLNK => Filetype::SymbolicLink,
        mode::S_IFSOCK => Filetype::SocketStream,
        _ => Filetype::Unknown,
    }
}

bitflags::bitflags! {
    /// Descriptor rights bitmask, in the guest binary interface's bit
    /// positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u64 {
        const FD_DATASYNC = 1 << 0;
        const FD_READ = 1 << 1;
        const FD_SEEK = 1 << 2;
        const FD_FDSTAT_SET_FLAGS = 1 << 3;
        const FD_SYNC = 1 << 4;
        const FD_TELL = 1 << 5;
        const FD_WRITE = 1 << 6;
        const FD_ADVISE = 1 << 7;
        const FD_ALLOCATE = 1 << 8;
        const PATH_CREATE_DIRECTORY = 1 << 9;
        const PATH_CREATE_FILE = 1 << 10;
        const PATH_LINK_SOURCE = 1 << 11;
        const PATH_LINK_TARGET = 1 << 12;
        const PATH_OPEN = 1 << 13;
        const FD_READDIR = 1 << 14;
        const PATH_READLINK = 1 << 15;
        const PATH_RENAME_SOURCE = 1 << 16;
        const PATH_RENAME_TARGET = 1 << 17;
        const PATH_FILESTAT_GET = 1 << 18;
        const PATH_FILESTAT_SET_SIZE = 1 << 19;
        const PATH_FILESTAT_SET_TIMES = 1 << 20;
        const FD_FILESTAT_GET = 1 << 21;
        const FD_FILESTAT_SET_SIZE = 1 << 22;
        const FD_FILESTAT_SET_TIMES = 1 << 23;
        const PATH_SYMLINK = 1 << 24;
        const PATH_REMOVE_DIRECTORY = 1 << 25;
        const PATH_UNLINK_FILE = 1 << 26;
        const POLL_FD_READWRITE = 1 << 27;
        const SOCK_SHUTDOWN = 1 << 28;
    }
}

bitflags::bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u16 {
        const APPEND = 1 << 0;
        const DSYNC = 1 << 1;
        const NONBLOCK = 1 << 2;
        const RSYNC = 1 << 3;
        const SYNC = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Open flags for path_open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OFlags: u16 {
        const CREAT = 1 << 0;
        const DIRECTORY = 1 << 1;
        const EXCL = 1 << 2;
        const TRUNC = 1 << 3;
    }
}

/// Rights granted to the standard streams.
const STDIO_RIGHTS: Rights = Rights::FD_READ
    .union(Rights::FD_WRITE)
    .union(Rights::FD_SYNC)
    .union(Rights::FD_FDSTAT_SET_FLAGS)
    .union(Rights::FD_FILESTAT_GET)
    .union(Rights::POLL_FD_READWRITE);

/// One guest descriptor.
#[derive(Debug, Clone)]
pub struct FdEntry {
    /// Controller-side descriptor backing this one.
    pub real_fd: i32,
    pub filetype: Filetype,
    pub rights: Rights,
    pub rights_inheriting: Rights,
    pub flags: FdFlags,
    /// Shim-side offset bookkeeping for fd_tell / degenerate fd_seek. The
    /// controller owns the authoritative file offset.
    pub offset: u64,
    /// Resolved real path (files and directories opened through the shim).
    pub path: Option<String>,
    /// Guest-visible path prefix (preopened directories only).
    pub preopen_guest_path: Option<String>,
}

impl FdEntry {
    fn stdio(real_fd: i32) -> Self {
        FdEntry {
            real_fd,
            filetype: Filetype::CharDevice,
            rights: STDIO_RIGHTS,
            rights_inheriting: Rights::empty(),
            flags: FdFlags::empty(),
            offset: 0,
            path: None,
            preopen_guest_path: None,
        }
    }
}

/// The guest import shim state: bindings plus the descriptor table.
pub struct GuestShim {
    posix: PosixBinding,
    misc: MiscBindings,
    fds: BTreeMap<u32, FdEntry>,
    next_fd: u32,
    args: Vec<String>,
    env: Vec<String>,
    random_state: u64,
    exit_code: Option<i32>,
}

impl GuestShim {
    pub fn new(
        posix: PosixBinding,
        misc: MiscBindings,
        args: Vec<String>,
        env: &BTreeMap<String, String>,
    ) -> Self {
        let mut fds = BTreeMap::new();
        fds.insert(0, FdEntry::stdio(0));
        fds.insert(1, FdEntry::stdio(1));
        fds.insert(2, FdEntry::stdio(2));
        GuestShim {
            posix,
            misc,
            fds,
            next_fd: 3,
            args,
            env: env.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
            random_state: 0xDEAD_BEEF_CAFE_BABE,
            exit_code: None,
        }
    }

    /// Exit code recorded by proc_exit, if the guest exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Open a preopened directory mapping and register its descriptor.
    pub fn preopen_dir(&mut self, guest_path: &str, real_path: &str) -> Result<u32, SysError> {
        let real_fd = self
            .posix
            .open_sync(real_path, oflag::O_RDONLY | oflag::O_DIRECTORY)?;
        let entry = FdEntry {
            real_fd,
            filetype: Filetype::Directory,
            rights: Rights::all(),
            rights_inheriting: Rights::all(),
            flags: FdFlags::empty(),
            offset: 0,
            path: Some(normalize(real_path)),
            preopen_guest_path: Some(guest_path.into()),
        };
        Ok(self.alloc_fd(entry))
    }

    fn alloc_fd(&mut self, entry: FdEntry) -> u32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, entry);
        fd
    }

    fn entry(&self, fd: i32) -> Result<&FdEntry, WasiErrno> {
        self.fds.get(&(fd as u32)).ok_or(WasiErrno::BadF)
    }

    fn entry_mut(&mut self, fd: i32) -> Result<&mut FdEntry, WasiErrno> {
        self.fds.get_mut(&(fd as u32)).ok_or(WasiErrno::BadF)
    }

    // ─── Argument and environment vectors ──────────────────────────────

    pub fn args_sizes_get(
        &self,
        mem: &mut [u8],
        argc_ptr: i32,
        buf_size_ptr: i32,
    ) -> Result<(), WasiErrno> {
        let total: usize = self.args.iter().map(|s| s.len() + 1).sum();
        mem_write_u32(mem, argc_ptr, self.args.len() as u32)?;
        mem_write_u32(mem, buf_size_ptr, total as u32)
    }

    pub fn args_get(&self, mem: &mut [u8], argv_ptr: i32, buf_ptr: i32) -> Result<(), WasiErrno> {
        write_string_table(mem, argv_ptr, buf_ptr, &self.args)
    }

    pub fn environ_sizes_get(
        &self,
        mem: &mut [u8],
        count_ptr: i32,
        buf_size_ptr: i32,
    ) -> Result<(), WasiErrno> {
        let total: usize = self.env.iter().map(|s| s.len() + 1).sum();
        mem_write_u32(mem, count_ptr, self.env.len() as u32)?;
        mem_write_u32(mem, buf_size_ptr, total as u32)
    }

    pub fn environ_get(
        &self,
        mem: &mut [u8],
        environ_ptr: i32,
        buf_ptr: i32,
    ) -> Result<(), WasiErrno> {
        write_string_table(mem, environ_ptr, buf_ptr, &self.env)
    }

    // ─── Descriptor I/O ────────────────────────────────────────────────

    pub fn fd_write(
        &mut self,
        mem: &mut [u8],
        fd: i32,
        iovs: i32,
        iovs_len: i32,
        nwritten_ptr: i32,
    ) -> Result<(), WasiErrno> {
        let entry = self.entry(fd)?;
        if !entry.rights.contains(Rights::FD_WRITE) {
            return Err(WasiErrno::Access);
        }
        let real_fd = entry.real_fd;
        let total = self.write_vectored(mem, real_fd, iovs, iovs_len, None)?;
        self.entry_mut(fd)?.offset += total as u64;
        mem_write_u32(mem, nwritten_ptr, total)
    }

    pub fn fd_pwrite(
        &mut self,
        mem: &mut [u8],
        fd: i32,
        iovs: i32,
        iovs_len: i32,
        offset: i64,
        nwritten_ptr: i32,
    ) -> Result<(), WasiErrno> {
        let entry = self.entry(fd)?;
        if !entry.rights.contains(Rights::FD_WRITE) {
            return Err(WasiErrno::Access);
        }
        let real_fd = entry.real_fd;
        let total = self.write_vectored(mem, real_fd, iovs, iovs_len, Some(offset))?;
        mem_write_u32(mem, nwritten_ptr, total)
    }

    pub fn fd_read(
        &mut self,
        mem: &mut [u8],
        fd: i32,
        iovs: i32,
        iovs_len: i32,
        nread_ptr: i32,
    ) -> Result<(), WasiErrno> {
        let entry = self.entry(fd)?;
        if !entry.rights.contains(Rights::FD_READ) {
            return Err(WasiErrno::Access);
        }
        let real_fd = entry.real_fd;
        let total = self.read_vectored(mem, real_fd, iovs, iovs_len, None)?;
        self.entry_mut(fd)?.offset += total as u64;
        mem_write_u32(mem, nread_ptr, total)
    }

    pub fn fd_pread(
        &mut self,
        mem: &mut [u8],
        fd: i32,
        iovs: i32,
        iovs_len: i32,
        offset: i64,
        nread_ptr: i32,
    ) -> Result<(), WasiErrno> {
        let entry = self.entry(fd)?;
        if !entry.rights.contains(Rights::FD_READ) {
            return Err(WasiErrno::Access);
        }
        let real_fd = entry.real_fd;
        let total = self.read_vectored(mem, real_fd, iovs, iovs_len, Some(offset))?;
        mem_write_u32(mem, nread_ptr, total)
    }

    fn write_vectored(
        &mut self,
        mem: &[u8],
        real_fd: i32,
        iovs: i32,
        iovs_len: i32,
        position: Option<i64>,
    ) -> Result<u32, WasiErrno> {
        let vecs = iovecs(mem, iovs, iovs_len)?;
        let mut total: u32 = 0;
        for (ptr, len) in vecs {
            let data = mem_slice(mem, ptr as i32, len as i32)?;
            let n = self
                .posix
                .write_sync(real_fd, data, 0, None, position)
                .map_err(|e| WasiErrno::from_sys(&e))?;
            total = total.saturating_add(n as u32);
            if n < len as usize {
                break;
            }
        }
        Ok(total)
    }

    fn read_vectored(
        &mut self,
        mem: &mut [u8],
        real_fd: i32,
        iovs: i32,
        iovs_len: i32,
        position: Option<i64>,
    ) -> Result<u32, WasiErrno> {
        let vecs = iovecs(mem, iovs, iovs_len)?;
        let mut total: u32 = 0;
        for (ptr, len) in vecs {
            let mut tmp = vec![0u8; len as usize];
            let n = self
                .posix
                .read_sync(real_fd, &mut tmp, 0, len as usize, position)
                .map_err(|e| WasiErrno::from_sys(&e))?;
            mem_slice_mut(mem, ptr as i32, len as i32)?.copy_from_slice(&tmp);
            total = total.saturating_add(n as u32);
        }
        Ok(total)
    }

    pub fn fd_close(&mut self, fd: i32) -> Result<(), WasiErrno> {
        if (0..3).contains(&fd) {
            return Err(WasiErrno::Access);
        }
        let real_fd = self.entry(fd)?.real_fd;
        self.posix
            .close_sync(real_fd)
            .map_err(|e| WasiErrno::from_sys(&e))?;
        self.fds.remove(&(fd as u32));
        Ok(())
    }

    // ─── Descriptor metadata ───────────────────────────────────────────

    pub fn fd_fdstat_get(&mut self, mem: &mut [u8], fd: i32, buf_ptr: i32) -> Result<(), WasiErrno> {
        let entry = self.entry(fd)?;
        let buf = mem_slice_mut(mem, buf_ptr, 24)?;
        buf.fill(0);
        buf[0] = entry.filetype as u8;
        buf[2..4].copy_from_slice(&entry.flags.bits().to_le_bytes());
        buf[8..16].copy_from_slice(&entry.rights.bits().to_le_bytes());
        buf[16..24].copy_from_slice(&entry.rights_inheriting.bits().to_le_bytes());
        Ok(())
    }

    pub fn fd_fdstat_set_flags(&mut self, _fd: i32, _flags: i32) -> Result<(), WasiErrno> {
        Err(WasiErrno::NotSup)
    }

    pub fn fd_filestat_get(
        &mut self,
        mem: &mut [u8],
        fd: i32,
        buf_ptr: i32,
    ) -> Result<(), WasiErrno> {
        let real_fd = self.entry(fd)?.real_fd;
        let stat = self
            .posix
            .fstat_sync(real_fd)
            .map_err(|e| WasiErrno::from_sys(&e))?;
        write_filestat(mem, buf_ptr, &stat)
    }

    pub fn fd_prestat_get(&mut self, mem: &mut [u8], fd: i32, buf_ptr: i32) -> Result<(), WasiErrno> {
        let entry = self.entry(fd)?;
        let guest_path = entry.preopen_guest_path.as_ref().ok_or(WasiErrno::BadF)?;
        let buf = mem_slice_mut(mem, buf_ptr, 8)?;
        buf.fill(0);
        // Tag 0: preopened directory.
        buf[4..8].copy_from_slice(&(guest_path.len() as u32).to_le_bytes());
        Ok(())
    }

    pub fn fd_prestat_dir_name(
        &mut self,
        mem: &mut [u8],
        fd: i32,
        path_ptr: i32,
        path_len: i32,
    ) -> Result<(), WasiErrno> {
        let entry = self.entry(fd)?;
        let guest_path = entry.preopen_guest_path.as_ref().ok_or(WasiErrno::BadF)?;
        let bytes = guest_path.as_bytes();
        if (path_len as u32 as usize) < bytes.len() {
            return Err(WasiErrno::Overflow);
        }
        mem_slice_mut(mem, path_ptr, bytes.len() as i32)?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn fd_seek(
        &mut self,
        mem: &mut [u8],
        fd: i32,
        offset: i64,
        whence: i32,
        newoffset_ptr: i32,
    ) -> Result<(), WasiErrno> {
        let entry = self.entry(fd)?;
        if entry.filetype == Filetype::CharDevice {
            return Err(WasiErrno::SPipe);
        }
        // The trap table has no seek; only seeks that do not move the
        // tracked offset can be honored.
        let tracked = entry.offset;
        let honored = match whence {
            0 => offset >= 0 && offset as u64 == tracked,
            1 => offset == 0,
            _ => false,
        };
        if !honored {
            return Err(WasiErrno::NotSup);
        }
        mem_write_u64(mem, newoffset_ptr, tracked)
    }

    pub fn fd_tell(&mut self, mem: &mut [u8], fd: i32, offset_ptr: i32) -> Result<(), WasiErrno> {
        let tracked = self.entry(fd)?.offset;
        mem_write_u64(mem, offset_ptr, tracked)
    }

    pub fn fd_sync(&mut self, fd: i32) -> Result<(), WasiErrno> {
        self.entry(fd)?;
        Ok(())
    }

    pub fn fd_readdir(
        &mut self,
        _mem: &mut [u8],
        _fd: i32,
        _buf: i32,
        _buf_len: i32,
        _cookie: i64,
        _bufused_ptr: i32,
    ) -> Result<(), WasiErrno> {
        Err(WasiErrno::NotSup)
    }

    // ─── Path operations ───────────────────────────────────────────────

    pub fn path_open(
        &mut self,
        mem: &mut [u8],
        dirfd: i32,
        _dirflags: i32,
        path_ptr: i32,
        path_len: i32,
        oflags_raw: i32,
        rights_base: i64,
        rights_inheriting: i64,
        fdflags_raw: i32,
        opened_ptr: i32,
    ) -> Result<(), WasiErrno> {
        let path = mem_str(mem, path_ptr, path_len)?;
        let resolved = self.resolve_path(dirfd, &path)?;
        let rights = Rights::from_bits_truncate(rights_base as u64);
        let rights_inheriting = Rights::from_bits_truncate(rights_inheriting as u64);
        let oflags = OFlags::from_bits_truncate(oflags_raw as u16);
        let fdflags = FdFlags::from_bits_truncate(fdflags_raw as u16);
        let flags = open_flags_for(oflags, rights, fdflags);

        let real_fd = self
            .posix
            .open_sync(&resolved, flags)
            .map_err(|e| WasiErrno::from_sys(&e))?;
        let filetype = match self.posix.fstat_sync(real_fd) {
            Ok(stat) => filetype_from_mode(stat.mode),
            Err(err) => {
                let _ = self.posix.close_sync(real_fd);
                return Err(WasiErrno::from_sys(&err));
            }
        };

        let fd = self.alloc_fd(FdEntry {
            real_fd,
            filetype,
            rights,
            rights_inheriting,
            flags: fdflags,
            offset: 0,
            path: Some(resolved),
            preopen_guest_path: None,
        });
        mem_write_u32(mem, opened_ptr, fd)
    }

    pub fn path_filestat_get(
        &mut self,
        mem: &mut [u8],
        dirfd: i32,
        _flags: i32,
        path_ptr: i32,
        path_len: i32,
        buf_ptr: i32,
    ) -> Result<(), WasiErrno> {
        let path = mem_str(mem, path_ptr, path_len)?;
        let resolved = self.resolve_path(dirfd, &path)?;
        let real_fd = self
            .posix
            .open_sync(&resolved, oflag::O_RDONLY)
            .map_err(|e| WasiErrno::from_sys(&e))?;
        let stat = self.posix.fstat_sync(real_fd);
        let _ = self.posix.close_sync(real_fd);
        let stat = stat.map_err(|e| WasiErrno::from_sys(&e))?;
        write_filestat(mem, buf_ptr, &stat)
    }

    /// Resolve a guest path against a preopened directory descriptor,
    /// rejecting every escape from the granted root. The raw input and its
    /// normalized resolution are both checked.
    fn resolve_path(&self, dirfd: i32, path: &str) -> Result<String, WasiErrno> {
        let dir = self.entry(dirfd)?;
        if dir.filetype != Filetype::Directory {
            return Err(WasiErrno::NotDir);
        }
        if !dir.rights.contains(Rights::PATH_OPEN) {
            return Err(WasiErrno::Access);
        }
        let base = dir.path.as_deref().ok_or(WasiErrno::NotDir)?;
        if !path.starts_with('/') && escapes_root(path) {
            return Err(WasiErrno::Perm);
        }
        let resolved = if path.starts_with('/') {
            normalize(path)
        } else {
            normalize(&format!("{}/{}", base, path))
        };
        if !is_within(&resolved, base) {
            return Err(WasiErrno::Perm);
        }
        Ok(resolved)
    }

    // ─── Process, clock, random, sockets ───────────────────────────────

    /// Record the exit code and report it to the controller. The caller
    /// transfers control away after this returns.
    pub fn proc_exit(&mut self, code: i32) {
        self.exit_code = Some(code);
        self.posix.exit(Some(code));
    }

    pub fn random_get(&mut self, mem: &mut [u8], buf_ptr: i32, buf_len: i32) -> Result<(), WasiErrno> {
        let buf = mem_slice_mut(mem, buf_ptr, buf_len)?;
        for byte in buf.iter_mut() {
            self.random_state ^= self.random_state << 13;
            self.random_state ^= self.random_state >> 7;
            self.random_state ^= self.random_state << 17;
            *byte = (self.random_state & 0xFF) as u8;
        }
        Ok(())
    }

    pub fn clock_time_get(
        &mut self,
        mem: &mut [u8],
        _clock_id: i32,
        _precision: i64,
        time_ptr: i32,
    ) -> Result<(), WasiErrno> {
        mem_write_u64(mem, time_ptr, self.misc.hrtime())
    }

    pub fn sched_yield(&mut self) -> Result<(), WasiErrno> {
        Ok(())
    }

    pub fn sock_recv(&mut self) -> Result<(), WasiErrno> {
        Err(WasiErrno::NotSup)
    }

    pub fn sock_send(&mut self) -> Result<(), WasiErrno> {
        Err(WasiErrno::NotSup)
    }

    pub fn sock_shutdown(&mut self) -> Result<(), WasiErrno> {
        Err(WasiErrno::NotSup)
    }

    #[cfg(test)]
    fn fd_table(&self) -> &BTreeMap<u32, FdEntry> {
        &self.fds
    }
}

/// Compute the flag bits for the open trap from the guest's more abstract
/// desired-rights-plus-open-flags encoding.
pub fn open_flags_for(oflags: OFlags, rights: Rights, fdflags: FdFlags) -> i64 {
    let read = rights.intersects(Rights::FD_READ | Rights::FD_READDIR);
    let write = rights.intersects(
        Rights::FD_WRITE
            | Rights::FD_DATASYNC
            | Rights::FD_ALLOCATE
            | Rights::FD_FILESTAT_SET_SIZE,
    );
    let mut flags = match (read, write) {
        (_, false) => oflag::O_RDONLY,
        (false, true) => oflag::O_WRONLY,
        (true, true) => oflag::O_RDWR,
    };
    if oflags.contains(OFlags::CREAT) {
        flags |= oflag::O_CREAT;
    }
    if oflags.contains(OFlags::DIRECTORY) {
        flags |= oflag::O_DIRECTORY;
    }
    if oflags.contains(OFlags::EXCL) {
        flags |= oflag::O_EXCL;
    }
    if oflags.contains(OFlags::TRUNC) {
        flags |= oflag::O_TRUNC;
    }
    if fdflags.contains(FdFlags::APPEND) {
        flags |= oflag::O_APPEND;
    }
    if fdflags.contains(FdFlags::NONBLOCK) {
        flags |= oflag::O_NONBLOCK;
    }
    if fdflags.contains(FdFlags::DSYNC) {
        flags |= oflag::O_DSYNC;
    }
    if fdflags.intersects(FdFlags::SYNC | FdFlags::RSYNC) {
        flags |= oflag::O_SYNC;
    }
    flags
}

// ─── Path containment helpers ──────────────────────────────────────────

/// Normalize a path: resolve `.` and `..`, collapse slashes.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        String::from("/")
    } else {
        let mut result = String::new();
        for part in &parts {
            result.push('/');
            result.push_str(part);
        }
        result
    }
}

/// Whether `path` stays within `root` after normalization.
pub fn is_within(path: &str, root: &str) -> bool {
    let norm_path = normalize(path);
    let norm_root = normalize(root);
    if norm_root == "/" {
        return true;
    }
    norm_path == norm_root || norm_path.starts_with(&format!("{}/", norm_root))
}

/// Whether a relative path climbs above its starting directory at any point.
pub fn escapes_root(path: &str) -> bool {
    let mut depth: i32 = 0;
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            _ => depth += 1,
        }
    }
    false
}

// ─── Guest memory helpers ──────────────────────────────────────────────

fn mem_range(mem_len: usize, ptr: i32, len: i32) -> Result<std::ops::Range<usize>, WasiErrno> {
    let start = ptr as u32 as usize;
    let len = len as u32 as usize;
    let end = start.checked_add(len).ok_or(WasiErrno::Fault)?;
    if end > mem_len {
        return Err(WasiErrno::Fault);
    }
    Ok(start..end)
}

fn mem_slice<'a>(mem: &'a [u8], ptr: i32, len: i32) -> Result<&'a [u8], WasiErrno> {
    let range = mem_range(mem.len(), ptr, len)?;
    Ok(&mem[range])
}

fn mem_slice_mut<'a>(mem: &'a mut [u8], ptr: i32, len: i32) -> Result<&'a mut [u8], WasiErrno> {
    let range = mem_range(mem.len(), ptr, len)?;
    Ok(&mut mem[range])
}

fn mem_str(mem: &[u8], ptr: i32, len: i32) -> Result<String, WasiErrno> {
    let bytes = mem_slice(mem, ptr, len)?;
    core::str::from_utf8(bytes)
        .map(String::from)
        .map_err(|_| WasiErrno::IlSeq)
}

fn mem_write_u32(mem: &mut [u8], ptr: i32, value: u32) -> Result<(), WasiErrno> {
    mem_slice_mut(mem, ptr, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn mem_write_u64(mem: &mut [u8], ptr: i32, value: u64) -> Result<(), WasiErrno> {
    mem_slice_mut(mem, ptr, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Decode a buffer vector: `iovs_len` consecutive (pointer, length) pairs.
fn iovecs(mem: &[u8], iovs: i32, iovs_len: i32) -> Result<Vec<(u32, u32)>, WasiErrno> {
    let raw = mem_slice(mem, iovs, iovs_len.saturating_mul(8))?;
    let mut vecs = Vec::with_capacity(iovs_len as usize);
    for pair in raw.chunks_exact(8) {
        let ptr = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
        let len = u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
        vecs.push((ptr, len));
    }
    Ok(vecs)
}

/// Serialize a string vector into guest memory: a pointer table at
/// `table_ptr`, then the NUL-terminated bytes at `buf_ptr`.
fn write_string_table(
    mem: &mut [u8],
    table_ptr: i32,
    buf_ptr: i32,
    strings: &[String],
) -> Result<(), WasiErrno> {
    let mut cursor = buf_ptr as u32;
    for (i, s) in strings.iter().enumerate() {
        mem_write_u32(mem, table_ptr.wrapping_add((i * 4) as i32), cursor)?;
        let bytes = s.as_bytes();
        mem_slice_mut(mem, cursor as i32, bytes.len() as i32)?.copy_from_slice(bytes);
        mem_slice_mut(mem, cursor.wrapping_add(bytes.len() as u32) as i32, 1)?[0] = 0;
        cursor = cursor
            .checked_add(bytes.len() as u32 + 1)
            .ok_or(WasiErrno::Fault)?;
    }
    Ok(())
}

/// Serialize a stat into the guest's 64-byte filestat layout.
fn write_filestat(mem: &mut [u8], ptr: i32, stat: &Stat) -> Result<(), WasiErrno> {
    let buf = mem_slice_mut(mem, ptr, 64)?;
    buf.fill(0);
    buf[0..8].copy_from_slice(&stat.dev.to_le_bytes());
    buf[8..16].copy_from_slice(&stat.ino.to_le_bytes());
    buf[16] = filetype_from_mode(stat.mode) as u8;
    buf[24..32].copy_from_slice(&stat.nlink.to_le_bytes());
    buf[32..40].copy_from_slice(&(stat.size.max(0) as u64).to_le_bytes());
    buf[40..48].copy_from_slice(&stat.atime.as_nanos().to_le_bytes());
    buf[48..56].copy_from_slice(&stat.mtime.as_nanos().to_le_bytes());
    buf[56..64].copy_from_slice(&stat.ctime.as_nanos().to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SyscallChannel;
    use crate::region::SharedRegion;
    use std::sync::{mpsc, Arc};

    /// A shim whose controller port goes nowhere. Only operations that never
    /// issue a syscall may be exercised on it.
    fn detached_shim() -> GuestShim {
        let region = Arc::new(SharedRegion::new(4096).unwrap());
        let (tx, _rx) = mpsc::channel();
        drop(_rx);
        let posix = PosixBinding::new(SyscallChannel::new(region, Arc::new(tx)));
        let mut env = BTreeMap::new();
        env.insert(String::from("HOME"), String::from("/home/user"));
        GuestShim::new(
            posix,
            MiscBindings,
            vec![String::from("prog.wasm"), String::from("--verbose")],
            &env,
        )
    }

    #[test]
    fn test_stdio_prepopulated() {
        let shim = detached_shim();
        for fd in 0..3 {
            let entry = &shim.fd_table()[&fd];
            assert_eq!(entry.filetype, Filetype::CharDevice);
            assert_eq!(entry.real_fd, fd as i32);
        }
    }

    #[test]
    fn test_args_vector_layout() {
        let shim = detached_shim();
        let mut mem = vec![0u8; 256];
        shim.args_sizes_get(&mut mem, 0, 4).unwrap();
        assert_eq!(u32::from_le_bytes(mem[0..4].try_into().unwrap()), 2);
        // "prog.wasm\0" + "--verbose\0"
        assert_eq!(u32::from_le_bytes(mem[4..8].try_into().unwrap()), 20);

        shim.args_get(&mut mem, 8, 64).unwrap();
        let ptr0 = u32::from_le_bytes(mem[8..12].try_into().unwrap());
        let ptr1 = u32::from_le_bytes(mem[12..16].try_into().unwrap());
        assert_eq!(ptr0, 64);
        assert_eq!(ptr1, 74);
        assert_eq!(&mem[64..74], b"prog.wasm\0");
        assert_eq!(&mem[74..84], b"--verbose\0");
    }

    #[test]
    fn test_environ_vector_layout() {
        let shim = detached_shim();
        let mut mem = vec![0u8; 256];
        shim.environ_sizes_get(&mut mem, 0, 4).unwrap();
        assert_eq!(u32::from_le_bytes(mem[0..4].try_into().unwrap()), 1);
        assert_eq!(
            u32::from_le_bytes(mem[4..8].try_into().unwrap()),
            "HOME=/home/user".len() as u32 + 1
        );
        shim.environ_get(&mut mem, 8, 32).unwrap();
        assert_eq!(&mem[32..48], b"HOME=/home/user\0");
    }

    #[test]
    fn test_fd_fdstat_get_layout() {
        let mut shim = detached_shim();
        let mut mem = vec![0u8; 64];
        shim.fd_fdstat_get(&mut mem, 1, 0).unwrap();
        assert_eq!(mem[0], Filetype::CharDevice as u8);
        let rights = u64::from_le_bytes(mem[8..16].try_into().unwrap());
        assert_eq!(rights, STDIO_RIGHTS.bits());
        let inheriting = u64::from_le_bytes(mem[16..24].try_into().unwrap());
        assert_eq!(inheriting, 0);
    }

    #[test]
    fn test_unknown_fd_is_badf() {
        let mut shim = detached_shim();
        let mut mem = vec![0u8; 64];
        assert_eq!(shim.fd_fdstat_get(&mut mem, 99, 0), Err(WasiErrno::BadF));
        assert_eq!(shim.fd_sync(99), Err(WasiErrno::BadF));
    }

    #[test]
    fn test_fd_close_protects_stdio() {
        let mut shim = detached_shim();
        for fd in 0..3 {
            assert_eq!(shim.fd_close(fd), Err(WasiErrno::Access));
        }
    }

    #[test]
    fn test_fd_seek_on_char_device_is_spipe() {
        let mut shim = detached_shim();
        let mut mem = vec![0u8; 16];
        assert_eq!(shim.fd_seek(&mut mem, 1, 0, 1, 0), Err(WasiErrno::SPipe));
    }

    #[test]
    fn test_sockets_unsupported() {
        let mut shim = detached_shim();
        assert_eq!(shim.sock_recv(), Err(WasiErrno::NotSup));
        assert_eq!(shim.sock_send(), Err(WasiErrno::NotSup));
        assert_eq!(shim.sock_shutdown(), Err(WasiErrno::NotSup));
    }

    #[test]
    fn test_random_get_fills_buffer() {
        let mut shim = detached_shim();
        let mut mem = vec![0u8; 32];
        shim.random_get(&mut mem, 0, 32).unwrap();
        assert!(mem.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_clock_time_is_stub() {
        let mut shim = detached_shim();
        let mut mem = vec![0xFFu8; 16];
        shim.clock_time_get(&mut mem, 0, 0, 0).unwrap();
        assert_eq!(u64::from_le_bytes(mem[0..8].try_into().unwrap()), 0);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("/app//data/"), "/app/data");
        assert_eq!(normalize("/app/./x/../y"), "/app/y");
        assert_eq!(normalize("a/b/../c"), "/a/c");
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/app/data/f.txt", "/app"));
        assert!(is_within("/app", "/app"));
        assert!(!is_within("/app2", "/app"));
        assert!(!is_within("/etc/passwd", "/app"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn test_escapes_root() {
        assert!(!escapes_root("a/b/c"));
        assert!(!escapes_root("a/../b"));
        assert!(escapes_root(".."));
        assert!(escapes_root("a/../../b"));
        assert!(escapes_root("../etc/passwd"));
    }

    #[test]
    fn test_filetype_from_mode() {
        assert_eq!(filetype_from_mode(mode::S_IFREG | 0o644), Filetype::RegularFile);
        assert_eq!(filetype_from_mode(mode::S_IFDIR | 0o755), Filetype::Directory);
        assert_eq!(filetype_from_mode(mode::S_IFCHR), Filetype::CharDevice);
        assert_eq!(filetype_from_mode(mode::S_IFLNK), Filetype::SymbolicLink);
        assert_eq!(filetype_from_mode(0), Filetype::Unknown);
    }

    #[test]
    fn test_open_flags_for() {
        let ro = open_flags_for(OFlags::empty(), Rights::FD_READ, FdFlags::empty());
        assert_eq!(ro, oflag::O_RDONLY);

        let rw_create = open_flags_for(
            OFlags::CREAT | OFlags::TRUNC,
            Rights::FD_READ | Rights::FD_WRITE,
            FdFlags::empty(),
        );
        assert_eq!(rw_create, oflag::O_RDWR | oflag::O_CREAT | oflag::O_TRUNC);

        let wo_append = open_flags_for(OFlags::empty(), Rights::FD_WRITE, FdFlags::APPEND);
        assert_eq!(wo_append, oflag::O_WRONLY | oflag::O_APPEND);

        let sync = open_flags_for(OFlags::empty(), Rights::FD_READ, FdFlags::RSYNC);
        assert_eq!(sync, oflag::O_RDONLY | oflag::O_SYNC);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(WasiErrno::from_host_code(-2), WasiErrno::NoEnt);
        assert_eq!(WasiErrno::from_host_code(-13), WasiErrno::Access);
        assert_eq!(WasiErrno::from_host_code(-9999), WasiErrno::Io);
        assert_eq!(
            WasiErrno::from_sys(&SysError::BadPosition { position: 4 }),
            WasiErrno::NotSup
        );
        assert_eq!(
            WasiErrno::from_sys(&SysError::ShortRead { wanted: 8, got: 3 }),
            WasiErrno::Io
        );
    }

    #[test]
    fn test_iovec_decoding() {
        let mut mem = vec![0u8; 64];
        // Two iovecs: (32, 5) and (40, 3).
        mem[0..4].copy_from_slice(&32u32.to_le_bytes());
        mem[4..8].copy_from_slice(&5u32.to_le_bytes());
        mem[8..12].copy_from_slice(&40u32.to_le_bytes());
        mem[12..16].copy_from_slice(&3u32.to_le_bytes());
        assert_eq!(iovecs(&mem, 0, 2).unwrap(), vec![(32, 5), (40, 3)]);
    }

    #[test]
    fn test_mem_helpers_reject_out_of_bounds() {
        let mut mem = vec![0u8; 16];
        assert_eq!(mem_slice(&mem, 12, 8).unwrap_err(), WasiErrno::Fault);
        assert_eq!(mem_write_u32(&mut mem, 14, 1).unwrap_err(), WasiErrno::Fault);
        assert_eq!(mem_str(&mem, 20, 1).unwrap_err(), WasiErrno::Fault);
    }

    #[test]
    fn test_write_filestat_layout() {
        let stat = Stat {
            dev: 1,
            ino: 2,
            nlink: 3,
            mode: mode::S_IFREG | 0o600,
            size: 512,
            atime: tether_codec::Timespec::new(1, 0),
            mtime: tether_codec::Timespec::new(2, 0),
            ctime: tether_codec::Timespec::new(3, 0),
            ..Stat::default()
        };
        let mut mem = vec![0u8; 64];
        write_filestat(&mut mem, 0, &stat).unwrap();
        assert_eq!(mem[16], Filetype::RegularFile as u8);
        assert_eq!(u64::from_le_bytes(mem[32..40].try_into().unwrap()), 512);
        assert_eq!(
            u64::from_le_bytes(mem[40..48].try_into().unwrap()),
            1_000_000_000
        );
    }
}
