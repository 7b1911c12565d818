//! Controller wire protocol.
//!
//! Two message shapes travel between the worker and the controller:
//!
//! - The **envelope** `{ id, name?, args }`, both directions. An envelope
//!   with a `name` is a signal from the controller (only `"init"` is
//!   recognized); an envelope without one completes an async request the
//!   worker sent earlier, matched by `id`.
//! - The **synchronous-call signal** `{ trap, args }`, outbound only,
//!   distinguished from the envelope protocol by shape. The controller
//!   answers it through the shared region, not with a reply envelope.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::region::SharedRegion;

/// Elevation argument selecting the blocking personality.
pub const PER_BLOCKING: u32 = 0x80;

/// Name of the one async request the worker issues at startup.
pub const ELEVATION_CALL: &str = "personality";

/// Name of the one recognized controller signal.
pub const INIT_SIGNAL: &str = "init";

/// Trap codes of the synchronous calls the controller performs. The
/// controller's dispatch table uses 32-bit x86 syscall numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Trap {
    Read = 3,
    Write = 4,
    Open = 5,
    Close = 6,
    Fstat64 = 197,
    Exit = 252,
}

/// The message envelope, both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Envelope {
    /// A named signal/request envelope.
    pub fn request(id: u64, name: &str, args: Vec<Value>) -> Self {
        Envelope {
            id,
            name: Some(name.into()),
            args,
        }
    }

    /// A completion envelope for a previously sent request.
    pub fn completion(id: u64, args: Vec<Value>) -> Self {
        Envelope {
            id,
            name: None,
            args,
        }
    }

    /// Whether this envelope is a named signal (as opposed to a completion).
    pub fn is_signal(&self) -> bool {
        self.name.is_some()
    }
}

/// Protocol-level errors. These are logged and never escalate past the
/// router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A named signal whose arguments do not have the documented shape.
    MalformedSignal { name: String, reason: String },
    /// A completion for an id with no outstanding request.
    UnknownCallId { id: u64 },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MalformedSignal { name, reason } => {
                write!(f, "malformed '{}' signal: {}", name, reason)
            }
            ProtocolError::UnknownCallId { id } => {
                write!(f, "completion for unknown call id {}", id)
            }
        }
    }
}

/// Arguments of the init signal. Positions beyond argv and the environment
/// (debug flag, pid) are accepted and ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitArgs {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// The closed set of recognized controller signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Init(InitArgs),
    /// A named signal this worker does not recognize. Logged and ignored.
    Unrecognized { name: String },
}

impl Signal {
    /// Classify an envelope. `Ok(None)` means the envelope is a completion,
    /// not a signal.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Signal>, ProtocolError> {
        let name = match &envelope.name {
            Some(name) => name.as_str(),
            None => return Ok(None),
        };
        if name != INIT_SIGNAL {
            return Ok(Some(Signal::Unrecognized { name: name.into() }));
        }
        let argv = envelope
            .args
            .first()
            .cloned()
            .ok_or_else(|| malformed(name, "missing argv"))?;
        let argv: Vec<String> = serde_json::from_value(argv)
            .map_err(|e| malformed(name, &format!("argv: {}", e)))?;
        let env = match envelope.args.get(1) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(env) => serde_json::from_value(env.clone())
                .map_err(|e| malformed(name, &format!("env: {}", e)))?,
        };
        Ok(Some(Signal::Init(InitArgs { argv, env })))
    }
}

fn malformed(name: &str, reason: &str) -> ProtocolError {
    ProtocolError::MalformedSignal {
        name: name.into(),
        reason: reason.into(),
    }
}

/// One synchronous call: a trap code plus up to six integer arguments,
/// zero-padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRequest {
    pub trap: u32,
    pub args: [i64; 6],
}

impl SyscallRequest {
    pub fn new(trap: Trap, args: &[i64]) -> Self {
        debug_assert!(args.len() <= 6);
        let mut padded = [0i64; 6];
        padded[..args.len()].copy_from_slice(args);
        SyscallRequest {
            trap: trap as u32,
            args: padded,
        }
    }
}

/// A message posted to the controller.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// An async envelope request. The elevation request attaches the shared
    /// region so the controller can answer synchronous calls through it.
    Request {
        envelope: Envelope,
        region: Option<Arc<SharedRegion>>,
    },
    /// A fire-and-forget synchronous-call signal; answered through the
    /// region.
    Syscall(SyscallRequest),
}

/// The worker's one-way channel to the controller.
pub trait ControllerPort: Send + Sync {
    fn post(&self, msg: OutboundMessage);
}

/// Shared handle to the controller port.
pub type PortHandle = Arc<dyn ControllerPort>;

impl ControllerPort for mpsc::Sender<OutboundMessage> {
    fn post(&self, msg: OutboundMessage) {
        // A gone receiver means the controller side is tearing down; there is
        // nobody left to report the failure to.
        if self.send(msg).is_err() {
            log::debug!("controller port closed, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_completion_shape() {
        let env = Envelope::completion(7, vec![Value::Null]);
        let text = serde_json::to_string(&env).unwrap();
        // `name` must be absent, not null, for completions.
        assert_eq!(text, r#"{"id":7,"args":[null]}"#);
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, env);
        assert!(!back.is_signal());
    }

    #[test]
    fn test_init_signal_parses() {
        let env = Envelope::request(
            1,
            INIT_SIGNAL,
            vec![
                json!(["worker", "prog.wasm", "--arg", "x"]),
                json!({"HOME": "/home/user"}),
                json!(false),
                json!(17),
            ],
        );
        let signal = Signal::from_envelope(&env).unwrap().unwrap();
        match signal {
            Signal::Init(init) => {
                assert_eq!(init.argv[1], "prog.wasm");
                assert_eq!(init.env["HOME"], "/home/user");
            }
            other => panic!("expected init, got {:?}", other),
        }
    }

    #[test]
    fn test_init_signal_without_env() {
        let env = Envelope::request(1, INIT_SIGNAL, vec![json!(["worker", "a.wasm"])]);
        let signal = Signal::from_envelope(&env).unwrap().unwrap();
        assert!(matches!(signal, Signal::Init(init) if init.env.is_empty()));
    }

    #[test]
    fn test_init_signal_malformed_argv() {
        let env = Envelope::request(1, INIT_SIGNAL, vec![json!(42)]);
        let err = Signal::from_envelope(&env).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedSignal { .. }));
    }

    #[test]
    fn test_unrecognized_signal() {
        let env = Envelope::request(1, "shutdown", vec![]);
        let signal = Signal::from_envelope(&env).unwrap().unwrap();
        assert_eq!(
            signal,
            Signal::Unrecognized {
                name: "shutdown".into()
            }
        );
    }

    #[test]
    fn test_completion_is_not_a_signal() {
        let env = Envelope::completion(3, vec![]);
        assert_eq!(Signal::from_envelope(&env).unwrap(), None);
    }

    #[test]
    fn test_syscall_args_zero_padded() {
        let req = SyscallRequest::new(Trap::Write, &[1, 12, 5]);
        assert_eq!(req.trap, 4);
        assert_eq!(req.args, [1, 12, 5, 0, 0, 0]);
    }

    #[test]
    fn test_trap_codes() {
        assert_eq!(Trap::Read as u32, 3);
        assert_eq!(Trap::Write as u32, 4);
        assert_eq!(Trap::Open as u32, 5);
        assert_eq!(Trap::Close as u32, 6);
        assert_eq!(Trap::Fstat64 as u32, 197);
        assert_eq!(Trap::Exit as u32, 252);
    }
}
