//! Tether worker: runs a sandboxed WASM guest against a remote kernel.
//!
//! A guest program compiled to WASM executes inside this cooperative worker
//! believing it issues ordinary blocking system calls, while the worker's
//! only channel to the privileged controller is asynchronous message
//! passing. The bridge in the middle converts each async round-trip into a
//! call that is genuinely blocking from the guest's point of view.
//!
//! # Architecture
//!
//! - `region`: the shared byte region plus its futex-style wait/notify pair
//! - `protocol`: controller message envelope, trap codes, outbound port
//! - `channel`: the synchronous call primitive (post, park, collect result)
//! - `posix`: open/read/write/close/fstat/exit over the channel
//! - `wasi`: the guest import surface over the posix bindings
//! - `imports`: wasmi linker registration and import namespace selection
//! - `args`: argument-vector parsing (executable, guest argv, preopens)
//! - `router`: the outer handshake state machine driving init → elevation →
//!   compile → instantiate → run
//!
//! Record marshaling (stat, dirent) lives in the `tether-codec` crate.

use std::fmt;

pub mod args;
pub mod channel;
pub mod imports;
pub mod posix;
pub mod protocol;
pub mod region;
pub mod router;
pub mod wasi;

pub use router::{KernelRouter, PhaseKind, RouterConfig};

/// Fatal startup errors. Anything here halts the worker; nothing is retried.
#[derive(Debug)]
pub enum StartupError {
    /// The argument vector could not be parsed.
    Args(args::ArgsError),
    /// The shared region could not be allocated.
    Region(region::RegionError),
    /// A syscall failed while loading the executable.
    Sys(posix::SysError),
    /// The executable exceeds the configured maximum size.
    ExecutableTooLarge { size: i64, max: usize },
    /// The import-lowering collaborator rejected the binary.
    Lowering(String),
    /// The binary failed to compile.
    Compile(String),
    /// The module imports nothing from a recognized namespace.
    NoRecognizedNamespace,
    /// The module imports from two different recognized namespaces.
    MultipleNamespaces { first: String, second: String },
    /// Instantiation or import registration failed.
    Instantiate(String),
    /// The entry point was missing or trapped for a reason other than exit.
    Start(String),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::Args(e) => write!(f, "bad argument vector: {}", e),
            StartupError::Region(e) => write!(f, "shared region: {}", e),
            StartupError::Sys(e) => write!(f, "loading executable: {}", e),
            StartupError::ExecutableTooLarge { size, max } => {
                write!(f, "executable size {} exceeds max size of {}", size, max)
            }
            StartupError::Lowering(e) => write!(f, "import lowering: {}", e),
            StartupError::Compile(e) => write!(f, "compile: {}", e),
            StartupError::NoRecognizedNamespace => {
                write!(f, "module imports nothing from a recognized namespace")
            }
            StartupError::MultipleNamespaces { first, second } => write!(
                f,
                "module imports from two recognized namespaces: {} and {}",
                first, second
            ),
            StartupError::Instantiate(e) => write!(f, "instantiate: {}", e),
            StartupError::Start(e) => write!(f, "start: {}", e),
        }
    }
}

impl From<args::ArgsError> for StartupError {
    fn from(e: args::ArgsError) -> Self {
        StartupError::Args(e)
    }
}

impl From<region::RegionError> for StartupError {
    fn from(e: region::RegionError) -> Self {
        StartupError::Region(e)
    }
}

impl From<posix::SysError> for StartupError {
    fn from(e: posix::SysError) -> Self {
        StartupError::Sys(e)
    }
}
