//! The outer handshake state machine.
//!
//! The router owns the worker's end of the controller conversation:
//!
//! ```text
//! WaitingForInit → WaitingForElevationAck → Running → Terminated
//! ```
//!
//! On init it builds the bindings over a fresh shared region and issues the
//! one async elevation request, the only call that legitimately travels the
//! envelope/callback path: it must complete before the synchronous machinery
//! is safe to use. On a successful ack it loads the guest binary
//! through the bindings, hands it to the import-lowering collaborator,
//! compiles and instantiates it with the shim's imports, and invokes its
//! entry point. Unrecognized or malformed controller traffic is logged and
//! ignored at every state; it never escalates to a router failure.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;

use serde_json::{json, Value};
use wasmi::{Engine, Linker, Module, Store};

use crate::args::{parse_worker_args, WorkerArgs};
use crate::channel::SyscallChannel;
use crate::imports;
use crate::posix::{oflag, MiscBindings, PosixBinding};
use crate::protocol::{
    Envelope, InitArgs, OutboundMessage, PortHandle, ProtocolError, Signal, ELEVATION_CALL,
    PER_BLOCKING,
};
use crate::region::{SharedRegion, SIGNAL_OFFSET};
use crate::wasi::GuestShim;
use crate::StartupError;

/// Hard cap on the guest executable size. Exceeding it is a fatal
/// configuration error, not something to stream around.
pub const MAX_EXE_BYTES: usize = 2 << 18;

/// Exported entry point every guest binary must declare.
pub const ENTRY_POINT: &str = "_start";

/// The import-lowering collaborator: a pure binary-in/binary-out transform
/// applied to the executable before compilation.
pub type ImportLowering = Box<dyn Fn(Vec<u8>) -> Result<Vec<u8>, String> + Send>;

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Total size of the shared region, header included.
    pub region_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            region_bytes: crate::region::DEFAULT_REGION_BYTES,
        }
    }
}

/// Observable router state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    WaitingForInit,
    WaitingForElevationAck,
    Running,
    Terminated,
}

enum Phase {
    WaitingForInit,
    WaitingForElevationAck { pending: PendingLaunch },
    Running,
    Terminated,
}

/// Everything the elevation continuation needs, carried as the payload of
/// the waiting state.
struct PendingLaunch {
    call_id: u64,
    posix: PosixBinding,
    misc: MiscBindings,
    args: WorkerArgs,
    env: BTreeMap<String, String>,
}

/// Kinds of async requests awaiting completion.
enum PendingCall {
    Elevation,
}

/// Pending async calls keyed by message id.
///
/// Only the elevation request uses this today, but completion is dispatched
/// purely by id, so concurrent async calls would each complete
/// independently, in any order.
struct OutstandingCalls {
    next_id: u64,
    pending: BTreeMap<u64, PendingCall>,
}

impl OutstandingCalls {
    fn new() -> Self {
        OutstandingCalls {
            next_id: 1,
            pending: BTreeMap::new(),
        }
    }

    fn register(&mut self, call: PendingCall) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, call);
        id
    }

    fn complete(&mut self, id: u64) -> Option<PendingCall> {
        self.pending.remove(&id)
    }
}

/// The router instance. Constructed once at worker startup; owns the
/// outstanding-call table and, via its phases, the bindings.
pub struct KernelRouter {
    port: PortHandle,
    config: RouterConfig,
    lower: ImportLowering,
    phase: Phase,
    outstanding: OutstandingCalls,
    exit_code: Option<i32>,
}

impl KernelRouter {
    pub fn new(port: PortHandle) -> Self {
        KernelRouter {
            port,
            config: RouterConfig::default(),
            lower: Box::new(|binary| Ok(binary)),
            phase: Phase::WaitingForInit,
            outstanding: OutstandingCalls::new(),
            exit_code: None,
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Install the import-lowering transform. The default is the identity.
    pub fn with_import_lowering(mut self, lower: ImportLowering) -> Self {
        self.lower = lower;
        self
    }

    pub fn phase(&self) -> PhaseKind {
        match self.phase {
            Phase::WaitingForInit => PhaseKind::WaitingForInit,
            Phase::WaitingForElevationAck { .. } => PhaseKind::WaitingForElevationAck,
            Phase::Running => PhaseKind::Running,
            Phase::Terminated => PhaseKind::Terminated,
        }
    }

    /// Exit code of the guest, once it has run to completion.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Feed controller envelopes until the router terminates or the inbox
    /// closes.
    pub fn run(&mut self, inbox: &mpsc::Receiver<Envelope>) {
        while self.phase() != PhaseKind::Terminated {
            match inbox.recv() {
                Ok(envelope) => self.handle_message(envelope),
                Err(_) => break,
            }
        }
    }

    /// Dispatch one controller envelope.
    pub fn handle_message(&mut self, envelope: Envelope) {
        match Signal::from_envelope(&envelope) {
            Err(err) => log::warn!("ignoring malformed controller message: {}", err),
            Ok(Some(Signal::Init(init))) => self.handle_init(init),
            Ok(Some(Signal::Unrecognized { name })) => {
                log::error!(
                    "unexpected signal '{}' (only '{}' is supported)",
                    name,
                    crate::protocol::INIT_SIGNAL
                );
            }
            Ok(None) => self.handle_completion(envelope),
        }
    }

    fn handle_init(&mut self, init: InitArgs) {
        if !matches!(self.phase, Phase::WaitingForInit) {
            log::warn!("ignoring repeated init signal");
            return;
        }
        match self.start_elevation(init) {
            Ok(pending) => self.phase = Phase::WaitingForElevationAck { pending },
            Err(err) => {
                log::error!("startup failed: {}", err);
                self.phase = Phase::Terminated;
            }
        }
    }

    /// Build the bindings over a fresh region and send the elevation
    /// request.
    fn start_elevation(&mut self, init: InitArgs) -> Result<PendingLaunch, StartupError> {
        let args = parse_worker_args(&init.argv)?;
        let region = Arc::new(SharedRegion::new(self.config.region_bytes)?);
        let chan = SyscallChannel::new(Arc::clone(&region), Arc::clone(&self.port));
        let posix = PosixBinding::new(chan);
        let misc = MiscBindings;

        let call_id = self.outstanding.register(PendingCall::Elevation);
        self.port.post(OutboundMessage::Request {
            envelope: Envelope::request(
                call_id,
                ELEVATION_CALL,
                vec![json!(PER_BLOCKING), json!(SIGNAL_OFFSET)],
            ),
            region: Some(region),
        });

        Ok(PendingLaunch {
            call_id,
            posix,
            misc,
            args,
            env: init.env,
        })
    }

    fn handle_completion(&mut self, envelope: Envelope) {
        match self.outstanding.complete(envelope.id) {
            None => log::warn!(
                "ignoring {}",
                ProtocolError::UnknownCallId { id: envelope.id }
            ),
            Some(PendingCall::Elevation) => self.handle_elevation_ack(envelope),
        }
    }

    fn handle_elevation_ack(&mut self, envelope: Envelope) {
        let pending = match std::mem::replace(&mut self.phase, Phase::Terminated) {
            Phase::WaitingForElevationAck { pending } if pending.call_id == envelope.id => pending,
            other => {
                log::warn!("elevation reply arrived in an unexpected state");
                self.phase = other;
                return;
            }
        };
        if envelope.args != [Value::Null] {
            // A failed elevation means the synchronous bridge itself cannot
            // be trusted; terminal, no retry.
            log::error!(
                "elevation call returned error: {}",
                serde_json::to_string(&envelope.args).unwrap_or_default()
            );
            return;
        }
        self.phase = Phase::Running;
        match self.launch(pending) {
            Ok(code) => {
                log::debug!("guest exited with code {}", code);
                self.exit_code = Some(code);
            }
            Err(err) => log::error!("failed to start guest: {}", err),
        }
        self.phase = Phase::Terminated;
    }

    /// Load, lower, compile, instantiate and start the guest binary. Runs
    /// the guest to completion; every guest import call re-enters the
    /// bindings from inside `entry.call`.
    fn launch(&mut self, pending: PendingLaunch) -> Result<i32, StartupError> {
        let PendingLaunch {
            mut posix,
            misc,
            args,
            env,
            ..
        } = pending;

        let fd = posix.open_sync(&args.exe_path, oflag::O_RDONLY)?;
        let stat = posix.fstat_sync(fd)?;
        let size = stat.size;
        if size < 0 || size as usize > MAX_EXE_BYTES {
            return Err(StartupError::ExecutableTooLarge {
                size,
                max: MAX_EXE_BYTES,
            });
        }
        let mut binary = vec![0u8; size as usize];
        posix.read_sync(fd, &mut binary, 0, size as usize, None)?;
        posix.close_sync(fd)?;

        let lowered = (self.lower)(binary).map_err(StartupError::Lowering)?;

        let engine = Engine::default();
        let module = Module::new(&engine, &lowered[..])
            .map_err(|e| StartupError::Compile(format!("{:?}", e)))?;
        let namespace = imports::select_namespace(&module)?;

        let mut shim = GuestShim::new(posix, misc, args.guest_argv.clone(), &env);
        for (guest_path, real_path) in &args.preopens {
            shim.preopen_dir(guest_path, real_path)?;
        }

        let mut store = Store::new(&engine, shim);
        let mut linker = Linker::<GuestShim>::new(&engine);
        imports::register(&mut linker, namespace)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| StartupError::Instantiate(format!("{:?}", e)))?
            .start(&mut store)
            .map_err(|e| StartupError::Instantiate(format!("{:?}", e)))?;
        let entry = instance
            .get_typed_func::<(), ()>(&store, ENTRY_POINT)
            .map_err(|e| StartupError::Start(format!("{:?}", e)))?;

        match entry.call(&mut store, ()) {
            Ok(()) => Ok(store.data().exit_code().unwrap_or(0)),
            Err(trap) => match trap.i32_exit_status() {
                Some(code) => Ok(code),
                None => Err(StartupError::Start(format!("{:?}", trap))),
            },
        }
    }
}

/// Convenience: a router posting into an mpsc channel.
pub fn channel_router(port: mpsc::Sender<OutboundMessage>) -> KernelRouter {
    let port: PortHandle = Arc::new(port);
    KernelRouter::new(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::INIT_SIGNAL;

    fn router_pair() -> (KernelRouter, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel();
        (channel_router(tx), rx)
    }

    fn init_envelope(argv: &[&str]) -> Envelope {
        Envelope::request(
            1,
            INIT_SIGNAL,
            vec![json!(argv), json!({}), json!(false), json!(1)],
        )
    }

    #[test]
    fn test_starts_waiting_for_init() {
        let (router, _rx) = router_pair();
        assert_eq!(router.phase(), PhaseKind::WaitingForInit);
    }

    #[test]
    fn test_init_sends_elevation_request() {
        let (mut router, rx) = router_pair();
        router.handle_message(init_envelope(&["worker", "prog.wasm"]));
        assert_eq!(router.phase(), PhaseKind::WaitingForElevationAck);

        let msg = rx.try_recv().unwrap();
        match msg {
            OutboundMessage::Request { envelope, region } => {
                assert_eq!(envelope.name.as_deref(), Some(ELEVATION_CALL));
                assert_eq!(envelope.args[0], json!(PER_BLOCKING));
                assert_eq!(envelope.args[1], json!(SIGNAL_OFFSET));
                let region = region.expect("elevation request must attach the region");
                assert_eq!(region.capacity(), RouterConfig::default().region_bytes);
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_argv_is_fatal() {
        let (mut router, _rx) = router_pair();
        router.handle_message(init_envelope(&["worker"]));
        assert_eq!(router.phase(), PhaseKind::Terminated);
    }

    #[test]
    fn test_repeated_init_ignored() {
        let (mut router, rx) = router_pair();
        router.handle_message(init_envelope(&["worker", "prog.wasm"]));
        let _ = rx.try_recv().unwrap();
        router.handle_message(init_envelope(&["worker", "other.wasm"]));
        assert_eq!(router.phase(), PhaseKind::WaitingForElevationAck);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unrecognized_signal_ignored() {
        let (mut router, _rx) = router_pair();
        router.handle_message(Envelope::request(9, "shutdown", vec![]));
        assert_eq!(router.phase(), PhaseKind::WaitingForInit);
    }

    #[test]
    fn test_unknown_completion_id_ignored() {
        let (mut router, _rx) = router_pair();
        router.handle_message(Envelope::completion(777, vec![Value::Null]));
        assert_eq!(router.phase(), PhaseKind::WaitingForInit);
    }

    #[test]
    fn test_failed_elevation_terminates() {
        let (mut router, rx) = router_pair();
        router.handle_message(init_envelope(&["worker", "prog.wasm"]));
        let id = match rx.try_recv().unwrap() {
            OutboundMessage::Request { envelope, .. } => envelope.id,
            other => panic!("expected request, got {:?}", other),
        };
        router.handle_message(Envelope::completion(id, vec![json!("EPERM")]));
        assert_eq!(router.phase(), PhaseKind::Terminated);
        assert_eq!(router.exit_code(), None);
    }

    #[test]
    fn test_malformed_init_ignored() {
        let (mut router, _rx) = router_pair();
        router.handle_message(Envelope::request(1, INIT_SIGNAL, vec![json!(42)]));
        assert_eq!(router.phase(), PhaseKind::WaitingForInit);
    }
}
