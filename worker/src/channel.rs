//! The synchronous syscall channel.
//!
//! `call_sync` turns one async round-trip into a call that looks blocking
//! from the caller's side: it posts a fire-and-forget syscall signal to the
//! controller, then parks the worker thread on the shared region until the
//! controller performs the operation out-of-band and flips the signal word.
//! The park on the region is the only way the worker ever yields control.
//!
//! The controller's execution model only delivers messages asynchronously; a
//! genuinely blocking call therefore needs memory the controller can write
//! from outside this thread plus a wait/notify pair over it. A future or
//! promise cannot stand in here: the guest's import contract requires the
//! call to not return until the reply exists.

use std::sync::Arc;

use crate::protocol::{OutboundMessage, PortHandle, SyscallRequest, Trap};
use crate::region::SharedRegion;

/// One synchronous call channel over one shared region.
///
/// Calls are strictly ordered: `call_sync` takes `&mut self`, and the single
/// worker thread is the only caller, so a second call cannot begin before
/// the previous signal was consumed and reset.
pub struct SyscallChannel {
    region: Arc<SharedRegion>,
    port: PortHandle,
}

impl SyscallChannel {
    pub fn new(region: Arc<SharedRegion>, port: PortHandle) -> Self {
        SyscallChannel { region, port }
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Issue one synchronous call and block until its result is ready.
    ///
    /// `args` is padded with zeroes to the six-slot trap convention. The
    /// returned value is the controller's signed result code; interpreting
    /// it is the caller's business.
    pub fn call_sync(&mut self, trap: Trap, args: &[i64]) -> i32 {
        // Clear any stale state before the request goes out.
        self.region.clear_signal();
        self.port
            .post(OutboundMessage::Syscall(SyscallRequest::new(trap, args)));

        let observed = self.region.wait_for_signal();
        if observed != 1 {
            // Something other than the controller wrote into the signal
            // word. There is no safe recovery at this layer; warn and keep
            // going.
            log::warn!(
                "unexpected value {} in signal word after {:?} call",
                observed,
                trap
            );
        }

        // Reset for the next call.
        self.region.clear_signal();
        self.region.result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::PAYLOAD_OFFSET;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;
    use std::thread;

    fn channel_pair() -> (SyscallChannel, mpsc::Receiver<OutboundMessage>) {
        let region = Arc::new(SharedRegion::new(4096).unwrap());
        let (tx, rx) = mpsc::channel();
        (SyscallChannel::new(region, Arc::new(tx)), rx)
    }

    #[test]
    fn test_call_sync_roundtrip() {
        let (mut chan, rx) = channel_pair();
        let region = Arc::clone(chan.region());

        let controller = thread::spawn(move || {
            let msg = rx.recv().unwrap();
            let req = match msg {
                OutboundMessage::Syscall(req) => req,
                other => panic!("expected syscall, got {:?}", other),
            };
            assert_eq!(req.trap, Trap::Write as u32);
            assert_eq!(req.args, [1, PAYLOAD_OFFSET as i64, 5, 0, 0, 0]);
            region.complete(5);
        });

        let result = chan.call_sync(Trap::Write, &[1, PAYLOAD_OFFSET as i64, 5]);
        assert_eq!(result, 5);
        controller.join().unwrap();
    }

    #[test]
    fn test_signal_reset_between_calls() {
        let (mut chan, rx) = channel_pair();
        let region = Arc::clone(chan.region());

        let controller = thread::spawn(move || {
            for result in [3, 9] {
                let _ = rx.recv().unwrap();
                region.complete(result);
            }
        });

        assert_eq!(chan.call_sync(Trap::Close, &[3]), 3);
        // The signal word must be back to idle before the next call starts.
        assert_eq!(chan.region().signal(), 0);
        assert_eq!(chan.call_sync(Trap::Close, &[4]), 9);
        assert_eq!(chan.region().signal(), 0);
        controller.join().unwrap();
    }

    #[test]
    fn test_calls_are_strictly_ordered() {
        let (mut chan, rx) = channel_pair();
        let region = Arc::clone(chan.region());
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let controller = {
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            thread::spawn(move || {
                for _ in 0..16 {
                    let _ = rx.recv().unwrap();
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    region.complete(0);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            })
        };

        for _ in 0..16 {
            // Each call must observe the previous one fully completed.
            assert_eq!(chan.call_sync(Trap::Close, &[0]), 0);
        }
        controller.join().unwrap();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
