//! Import registration for the guest binary.
//!
//! The guest's declared imports decide which of the two recognized namespace
//! names the shim answers to; spanning both is a startup error. Every import
//! follows the snapshot calling convention: integer/pointer arguments, at
//! most one result, extra results through pointer parameters.

use wasmi::core::Trap;
use wasmi::{Caller, Linker, Module};

use crate::wasi::{GuestShim, WasiErrno};
use crate::StartupError;

/// The namespace names a guest binary may import the shim under.
pub const RECOGNIZED_NAMESPACES: [&str; 2] = ["wasi_snapshot_preview1", "wasi_unstable"];

/// Inspect a compiled module's imports and pick the one recognized
/// namespace it uses.
pub fn select_namespace(module: &Module) -> Result<&'static str, StartupError> {
    let mut selected: Option<&'static str> = None;
    for import in module.imports() {
        let Some(&ns) = RECOGNIZED_NAMESPACES
            .iter()
            .find(|&&ns| ns == import.module())
        else {
            continue;
        };
        match selected {
            None => selected = Some(ns),
            Some(first) if first != ns => {
                return Err(StartupError::MultipleNamespaces {
                    first: first.into(),
                    second: ns.into(),
                })
            }
            Some(_) => {}
        }
    }
    selected.ok_or(StartupError::NoRecognizedNamespace)
}

/// Run a shim operation against the caller's exported guest memory and fold
/// the outcome into the guest-visible errno.
fn with_mem<F>(mut caller: Caller<'_, GuestShim>, f: F) -> i32
where
    F: FnOnce(&mut GuestShim, &mut [u8]) -> Result<(), WasiErrno>,
{
    let Some(memory) = caller
        .get_export("memory")
        .and_then(wasmi::Extern::into_memory)
    else {
        return WasiErrno::Inval.to_errno();
    };
    let (mem, shim) = memory.data_and_store_mut(&mut caller);
    match f(shim, mem) {
        Ok(()) => WasiErrno::Success.to_errno(),
        Err(errno) => errno.to_errno(),
    }
}

/// Fold a memory-free shim operation into an errno.
fn errno_of(result: Result<(), WasiErrno>) -> i32 {
    match result {
        Ok(()) => WasiErrno::Success.to_errno(),
        Err(errno) => errno.to_errno(),
    }
}

/// Register the whole import surface under `namespace`.
pub fn register(linker: &mut Linker<GuestShim>, namespace: &str) -> Result<(), StartupError> {
    let ns = namespace;

    linker
        .func_wrap(ns, "args_get", |caller: Caller<'_, GuestShim>, argv: i32, buf: i32| {
            with_mem(caller, |shim, mem| shim.args_get(mem, argv, buf))
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "args_sizes_get",
                |caller: Caller<'_, GuestShim>, argc: i32, size: i32| {
                    with_mem(caller, |shim, mem| shim.args_sizes_get(mem, argc, size))
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "environ_get",
                |caller: Caller<'_, GuestShim>, environ: i32, buf: i32| {
                    with_mem(caller, |shim, mem| shim.environ_get(mem, environ, buf))
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "environ_sizes_get",
                |caller: Caller<'_, GuestShim>, count: i32, size: i32| {
                    with_mem(caller, |shim, mem| shim.environ_sizes_get(mem, count, size))
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "clock_time_get",
                |caller: Caller<'_, GuestShim>, id: i32, precision: i64, time: i32| {
                    with_mem(caller, |shim, mem| {
                        shim.clock_time_get(mem, id, precision, time)
                    })
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "fd_write",
                |caller: Caller<'_, GuestShim>, fd: i32, iovs: i32, len: i32, nwritten: i32| {
                    with_mem(caller, |shim, mem| {
                        shim.fd_write(mem, fd, iovs, len, nwritten)
                    })
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "fd_read",
                |caller: Caller<'_, GuestShim>, fd: i32, iovs: i32, len: i32, nread: i32| {
                    with_mem(caller, |shim, mem| shim.fd_read(mem, fd, iovs, len, nread))
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "fd_pwrite",
                |caller: Caller<'_, GuestShim>,
                 fd: i32,
                 iovs: i32,
                 len: i32,
                 offset: i64,
                 nwritten: i32| {
                    with_mem(caller, |shim, mem| {
                        shim.fd_pwrite(mem, fd, iovs, len, offset, nwritten)
                    })
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "fd_pread",
                |caller: Caller<'_, GuestShim>,
                 fd: i32,
                 iovs: i32,
                 len: i32,
                 offset: i64,
                 nread: i32| {
                    with_mem(caller, |shim, mem| {
                        shim.fd_pread(mem, fd, iovs, len, offset, nread)
                    })
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(ns, "fd_close", |mut caller: Caller<'_, GuestShim>, fd: i32| {
                errno_of(caller.data_mut().fd_close(fd))
            })
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "fd_fdstat_get",
                |caller: Caller<'_, GuestShim>, fd: i32, buf: i32| {
                    with_mem(caller, |shim, mem| shim.fd_fdstat_get(mem, fd, buf))
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "fd_fdstat_set_flags",
                |mut caller: Caller<'_, GuestShim>, fd: i32, flags: i32| {
                    errno_of(caller.data_mut().fd_fdstat_set_flags(fd, flags))
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "fd_filestat_get",
                |caller: Caller<'_, GuestShim>, fd: i32, buf: i32| {
                    with_mem(caller, |shim, mem| shim.fd_filestat_get(mem, fd, buf))
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "fd_prestat_get",
                |caller: Caller<'_, GuestShim>, fd: i32, buf: i32| {
                    with_mem(caller, |shim, mem| shim.fd_prestat_get(mem, fd, buf))
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "fd_prestat_dir_name",
                |caller: Caller<'_, GuestShim>, fd: i32, path: i32, len: i32| {
                    with_mem(caller, |shim, mem| {
                        shim.fd_prestat_dir_name(mem, fd, path, len)
                    })
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "fd_seek",
                |caller: Caller<'_, GuestShim>, fd: i32, offset: i64, whence: i32, out: i32| {
                    with_mem(caller, |shim, mem| {
                        shim.fd_seek(mem, fd, offset, whence, out)
                    })
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "fd_tell",
                |caller: Caller<'_, GuestShim>, fd: i32, out: i32| {
                    with_mem(caller, |shim, mem| shim.fd_tell(mem, fd, out))
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(ns, "fd_sync", |mut caller: Caller<'_, GuestShim>, fd: i32| {
                errno_of(caller.data_mut().fd_sync(fd))
            })
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "fd_readdir",
                |caller: Caller<'_, GuestShim>,
                 fd: i32,
                 buf: i32,
                 buf_len: i32,
                 cookie: i64,
                 used: i32| {
                    with_mem(caller, |shim, mem| {
                        shim.fd_readdir(mem, fd, buf, buf_len, cookie, used)
                    })
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "path_open",
                |caller: Caller<'_, GuestShim>,
                 dirfd: i32,
                 dirflags: i32,
                 path: i32,
                 path_len: i32,
                 oflags: i32,
                 rights_base: i64,
                 rights_inheriting: i64,
                 fdflags: i32,
                 opened: i32| {
                    with_mem(caller, |shim, mem| {
                        shim.path_open(
                            mem,
                            dirfd,
                            dirflags,
                            path,
                            path_len,
                            oflags,
                            rights_base,
                            rights_inheriting,
                            fdflags,
                            opened,
                        )
                    })
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "path_filestat_get",
                |caller: Caller<'_, GuestShim>,
                 dirfd: i32,
                 flags: i32,
                 path: i32,
                 path_len: i32,
                 buf: i32| {
                    with_mem(caller, |shim, mem| {
                        shim.path_filestat_get(mem, dirfd, flags, path, path_len, buf)
                    })
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "proc_exit",
                |mut caller: Caller<'_, GuestShim>, code: i32| -> Result<(), Trap> {
                    caller.data_mut().proc_exit(code);
                    Err(Trap::i32_exit(code))
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "random_get",
                |caller: Caller<'_, GuestShim>, buf: i32, len: i32| {
                    with_mem(caller, |shim, mem| shim.random_get(mem, buf, len))
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(ns, "sched_yield", |mut caller: Caller<'_, GuestShim>| {
                errno_of(caller.data_mut().sched_yield())
            })
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "sock_recv",
                |mut caller: Caller<'_, GuestShim>,
                 _fd: i32,
                 _ri_data: i32,
                 _ri_len: i32,
                 _ri_flags: i32,
                 _ro_len: i32,
                 _ro_flags: i32| {
                    errno_of(caller.data_mut().sock_recv())
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "sock_send",
                |mut caller: Caller<'_, GuestShim>,
                 _fd: i32,
                 _si_data: i32,
                 _si_len: i32,
                 _si_flags: i32,
                 _so_len: i32| {
                    errno_of(caller.data_mut().sock_send())
                },
            )
        })
        .and_then(|linker| {
            linker.func_wrap(
                ns,
                "sock_shutdown",
                |mut caller: Caller<'_, GuestShim>, _fd: i32, _how: i32| {
                    errno_of(caller.data_mut().sock_shutdown())
                },
            )
        })
        .map(|_| ())
        .map_err(|e| StartupError::Instantiate(format!("{:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmi::Engine;

    // (module
    //   (import "wasi_snapshot_preview1" "proc_exit" (func (param i32))))
    const SNAPSHOT_IMPORT: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // magic + version
        0x01, 0x05, 0x01, 0x60, 0x01, 0x7f, 0x00, // type: (i32) -> ()
        0x02, 0x24, 0x01, // import section, 1 entry
        0x16, b'w', b'a', b's', b'i', b'_', b's', b'n', b'a', b'p', b's', b'h', b'o', b't',
        b'_', b'p', b'r', b'e', b'v', b'i', b'e', b'w', b'1', // "wasi_snapshot_preview1"
        0x09, b'p', b'r', b'o', b'c', b'_', b'e', b'x', b'i', b't', // "proc_exit"
        0x00, 0x00, // func import, type 0
    ];

    // (module
    //   (import "wasi_unstable" "proc_exit" (func (param i32))))
    const UNSTABLE_IMPORT: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, //
        0x01, 0x05, 0x01, 0x60, 0x01, 0x7f, 0x00, //
        0x02, 0x1b, 0x01, //
        0x0d, b'w', b'a', b's', b'i', b'_', b'u', b'n', b's', b't', b'a', b'b', b'l', b'e', //
        0x09, b'p', b'r', b'o', b'c', b'_', b'e', b'x', b'i', b't', //
        0x00, 0x00, //
    ];

    // (module
    //   (import "wasi_snapshot_preview1" "proc_exit" (func (param i32)))
    //   (import "wasi_unstable" "sched_yield" (func (result i32))))
    const MIXED_IMPORTS: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, //
        0x01, 0x09, 0x02, // type section, 2 types
        0x60, 0x01, 0x7f, 0x00, // (i32) -> ()
        0x60, 0x00, 0x01, 0x7f, // () -> (i32)
        0x02, 0x40, 0x02, // import section, 2 entries
        0x16, b'w', b'a', b's', b'i', b'_', b's', b'n', b'a', b'p', b's', b'h', b'o', b't',
        b'_', b'p', b'r', b'e', b'v', b'i', b'e', b'w', b'1', //
        0x09, b'p', b'r', b'o', b'c', b'_', b'e', b'x', b'i', b't', //
        0x00, 0x00, //
        0x0d, b'w', b'a', b's', b'i', b'_', b'u', b'n', b's', b't', b'a', b'b', b'l', b'e', //
        0x0b, b's', b'c', b'h', b'e', b'd', b'_', b'y', b'i', b'e', b'l', b'd', //
        0x00, 0x01, //
    ];

    // (module) with no imports at all.
    const NO_IMPORTS: &[u8] = &[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

    fn module(bytes: &[u8]) -> Module {
        Module::new(&Engine::default(), bytes).unwrap()
    }

    #[test]
    fn test_selects_snapshot_namespace() {
        assert_eq!(
            select_namespace(&module(SNAPSHOT_IMPORT)).unwrap(),
            "wasi_snapshot_preview1"
        );
    }

    #[test]
    fn test_selects_unstable_namespace() {
        assert_eq!(
            select_namespace(&module(UNSTABLE_IMPORT)).unwrap(),
            "wasi_unstable"
        );
    }

    #[test]
    fn test_mixed_namespaces_rejected() {
        let err = select_namespace(&module(MIXED_IMPORTS)).unwrap_err();
        assert!(matches!(err, StartupError::MultipleNamespaces { .. }));
    }

    #[test]
    fn test_no_recognized_namespace_rejected() {
        let err = select_namespace(&module(NO_IMPORTS)).unwrap_err();
        assert!(matches!(err, StartupError::NoRecognizedNamespace));
    }

    #[test]
    fn test_register_covers_both_namespaces() {
        let engine = Engine::default();
        for ns in RECOGNIZED_NAMESPACES {
            let mut linker = Linker::<GuestShim>::new(&engine);
            register(&mut linker, ns).unwrap();
        }
    }
}
