//! Purpose: Deliver payloads to caller handlers under the streaming protocol.
//! Exports: `ResponseHandler`, `Delivery`.
//! Role: One `Delivery` per admitted or rejected request; the only path to a handler.
//! Invariants: Handler calls for one request are serialized and keep emission order.
//! Invariants: At most one `finished = true` call per request, and it is the last.
//! Invariants: No lock is held while a handler runs; `cancel` never waits on one.
//! Invariants: Payload views passed to handlers are only valid for the call.
use super::error::{Error, ErrorKind};
use super::kind::ResponseKind;
use std::cell::RefCell;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Receiver of a request's payload stream.
pub trait ResponseHandler: Send + Sync + 'static {
    fn on_response(&self, request_id: u32, payload: &[u8], kind: ResponseKind, finished: bool);
}

impl<F> ResponseHandler for F
where
    F: Fn(u32, &[u8], ResponseKind, bool) + Send + Sync + 'static,
{
    fn on_response(&self, request_id: u32, payload: &[u8], kind: ResponseKind, finished: bool) {
        self(request_id, payload, kind, finished)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Open,
    Finished,
    Cancelled,
}

struct State {
    phase: Phase,
    // An intermediate handler call is running.
    busy: bool,
    // Forced terminal waiting for the running handler call to return.
    pending_cancel: Option<Vec<u8>>,
}

pub struct Delivery {
    request_id: u32,
    handler: Box<dyn ResponseHandler>,
    state: Mutex<State>,
    idle: Condvar,
}

thread_local! {
    // Deliveries whose intermediate handler is currently running on this thread.
    static ACTIVE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct ActiveGuard(usize);

impl ActiveGuard {
    fn enter(delivery: &Delivery) -> Self {
        let addr = delivery as *const Delivery as usize;
        ACTIVE.with(|active| active.borrow_mut().push(addr));
        Self(addr)
    }

    fn is_active(delivery: &Delivery) -> bool {
        let addr = delivery as *const Delivery as usize;
        ACTIVE.with(|active| active.borrow().contains(&addr))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|addr| *addr == self.0) {
                active.remove(pos);
            }
        });
    }
}

/// Clears `busy` when an intermediate call ends. On unwind a pending cancel
/// is left in place for the terminal path to deliver.
struct BusyGuard<'a> {
    delivery: &'a Delivery,
    settled: bool,
}

impl BusyGuard<'_> {
    fn settle(mut self) -> Option<Vec<u8>> {
        self.settled = true;
        self.delivery.end_call(true)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.delivery.end_call(false);
        }
    }
}

impl Delivery {
    pub fn new(request_id: u32, handler: Box<dyn ResponseHandler>) -> Self {
        Self {
            request_id,
            handler,
            state: Mutex::new(State {
                phase: Phase::Open,
                busy: false,
                pending_cancel: None,
            }),
            idle: Condvar::new(),
        }
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// False once a terminal has been committed, even while its handler call runs.
    pub fn is_open(&self) -> bool {
        lock(&self.state).phase == Phase::Open
    }

    /// Delivers an intermediate payload.
    pub fn emit(&self, payload: &[u8], kind: ResponseKind) -> Result<(), Error> {
        if ActiveGuard::is_active(self) {
            tracing::error!(
                request_id = self.request_id,
                "payload emitted from inside its own handler; dropped"
            );
            return Err(Error::new(ErrorKind::ContractViolation)
                .with_message("payload emitted from inside its own handler")
                .with_request_id(self.request_id));
        }
        let mut state = self.wait_idle();
        if let Some(reason) = state.pending_cancel.take() {
            state.phase = Phase::Cancelled;
            drop(state);
            return Err(self.deliver_cancel(&reason));
        }
        match state.phase {
            Phase::Open => {}
            Phase::Finished => {
                tracing::error!(
                    request_id = self.request_id,
                    "payload emitted after terminal; dropped"
                );
                return Err(Error::new(ErrorKind::ContractViolation)
                    .with_message("payload emitted after terminal")
                    .with_request_id(self.request_id));
            }
            Phase::Cancelled => {
                return Err(Error::new(ErrorKind::ContextDestroyed)
                    .with_request_id(self.request_id));
            }
        }
        state.busy = true;
        drop(state);

        let call = BusyGuard {
            delivery: self,
            settled: false,
        };
        {
            let _active = ActiveGuard::enter(self);
            self.handler
                .on_response(self.request_id, payload, kind, false);
        }
        match call.settle() {
            Some(reason) => Err(self.deliver_cancel(&reason)),
            None => Ok(()),
        }
    }

    /// Delivers the terminal payload. Returns false when the request was
    /// already resolved and nothing reached the handler.
    pub fn finish(&self, payload: &[u8], kind: ResponseKind) -> bool {
        let mut state = self.wait_idle();
        if let Some(reason) = state.pending_cancel.take() {
            state.phase = Phase::Cancelled;
            drop(state);
            self.deliver_cancel(&reason);
            return false;
        }
        match state.phase {
            Phase::Open => {
                state.phase = Phase::Finished;
                drop(state);
                self.invoke_terminal(payload, kind);
                true
            }
            Phase::Finished => {
                tracing::error!(
                    request_id = self.request_id,
                    "second terminal payload; dropped"
                );
                false
            }
            Phase::Cancelled => {
                tracing::debug!(
                    request_id = self.request_id,
                    "result of cancelled request discarded"
                );
                false
            }
        }
    }

    /// Forces a terminal error. While an intermediate handler call is running
    /// (on any thread) the terminal is delivered as soon as that call returns.
    pub fn cancel(&self, reason: &Error) {
        let payload = reason.to_payload();
        let mut state = lock(&self.state);
        if state.phase != Phase::Open {
            return;
        }
        if state.busy {
            state.pending_cancel = Some(payload);
            return;
        }
        state.phase = Phase::Cancelled;
        drop(state);
        self.invoke_terminal(&payload, ResponseKind::Error);
    }

    fn wait_idle(&self) -> MutexGuard<'_, State> {
        self.idle
            .wait_while(lock(&self.state), |state| state.busy)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn end_call(&self, take_cancel: bool) -> Option<Vec<u8>> {
        let mut state = lock(&self.state);
        state.busy = false;
        let reason = if take_cancel {
            state.pending_cancel.take()
        } else {
            None
        };
        if reason.is_some() {
            state.phase = Phase::Cancelled;
        }
        drop(state);
        self.idle.notify_all();
        reason
    }

    fn deliver_cancel(&self, reason: &[u8]) -> Error {
        self.invoke_terminal(reason, ResponseKind::Error);
        Error::new(ErrorKind::ContextDestroyed).with_request_id(self.request_id)
    }

    fn invoke_terminal(&self, payload: &[u8], kind: ResponseKind) {
        self.handler.on_response(self.request_id, payload, kind, true);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::{Delivery, ResponseHandler};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::kind::ResponseKind;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<(u32, Vec<u8>, ResponseKind, bool)>>>;

    fn recorder() -> (Log, Box<dyn ResponseHandler>) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let handler = move |id: u32, payload: &[u8], kind: ResponseKind, finished: bool| {
            sink.lock()
                .expect("lock")
                .push((id, payload.to_vec(), kind, finished));
        };
        (log, Box::new(handler))
    }

    #[test]
    fn terminal_closes_the_stream() {
        let (log, handler) = recorder();
        let delivery = Delivery::new(7, handler);
        delivery.emit(b"a", ResponseKind::custom()).expect("emit");
        assert!(delivery.finish(b"done", ResponseKind::Success));

        let err = delivery
            .emit(b"late", ResponseKind::custom())
            .expect_err("emit after terminal");
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert!(!delivery.finish(b"again", ResponseKind::Success));

        let log = log.lock().expect("lock");
        assert_eq!(log.len(), 2);
        assert_eq!(log[1], (7, b"done".to_vec(), ResponseKind::Success, true));
    }

    #[test]
    fn cancel_wins_over_late_result() {
        let (log, handler) = recorder();
        let delivery = Delivery::new(1, handler);
        delivery.cancel(&Error::new(ErrorKind::ContextDestroyed));
        assert!(!delivery.finish(b"late", ResponseKind::Success));
        let err = delivery
            .emit(b"late", ResponseKind::custom())
            .expect_err("emit after cancel");
        assert_eq!(err.kind(), ErrorKind::ContextDestroyed);

        let log = log.lock().expect("lock");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].2, ResponseKind::Error);
        assert!(log[0].3);
    }

    #[test]
    fn cancel_from_own_handler_is_deferred() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<Arc<Delivery>>>> = Arc::new(Mutex::new(None));
        let (sink, me) = (log.clone(), slot.clone());
        let handler = move |id: u32, payload: &[u8], kind: ResponseKind, finished: bool| {
            sink.lock()
                .expect("lock")
                .push((id, payload.to_vec(), kind, finished));
            if !finished {
                let delivery = me.lock().expect("lock").clone().expect("delivery");
                delivery.cancel(&Error::new(ErrorKind::ContextDestroyed));
            }
        };
        let delivery = Arc::new(Delivery::new(3, Box::new(handler)));
        *slot.lock().expect("lock") = Some(delivery.clone());

        let err = delivery
            .emit(b"progress", ResponseKind::custom())
            .expect_err("cancelled during emit");
        assert_eq!(err.kind(), ErrorKind::ContextDestroyed);
        assert!(!delivery.is_open());

        let log = log.lock().expect("lock");
        assert_eq!(log.len(), 2);
        assert!(!log[0].3);
        assert_eq!(log[1].2, ResponseKind::Error);
        assert!(log[1].3);
    }

    #[test]
    fn cancel_from_other_thread_waits_for_running_handler() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (entered_tx, release_rx) = (Mutex::new(entered_tx), Mutex::new(release_rx));
        let sink = log.clone();
        let handler = move |id: u32, payload: &[u8], kind: ResponseKind, finished: bool| {
            sink.lock()
                .expect("lock")
                .push((id, payload.to_vec(), kind, finished));
            if !finished {
                let _ = entered_tx.lock().expect("lock").send(());
                let _ = release_rx.lock().expect("lock").recv();
            }
        };
        let delivery = Arc::new(Delivery::new(4, Box::new(handler)));

        let emitter = {
            let delivery = delivery.clone();
            thread::spawn(move || delivery.emit(b"progress", ResponseKind::custom()))
        };
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("handler entered");

        // Returns while the intermediate call is still running.
        delivery.cancel(&Error::new(ErrorKind::ContextDestroyed));
        assert!(delivery.is_open());
        assert_eq!(log.lock().expect("lock").len(), 1);

        release_tx.send(()).expect("release");
        let err = emitter
            .join()
            .expect("emitter")
            .expect_err("cancelled while handler ran");
        assert_eq!(err.kind(), ErrorKind::ContextDestroyed);
        assert!(!delivery.is_open());
        assert!(!delivery.finish(b"late", ResponseKind::Success));

        let log = log.lock().expect("lock");
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].2, ResponseKind::Error);
        assert!(log[1].3);
    }

    #[test]
    fn emit_from_own_handler_is_rejected() {
        let outcome: Arc<Mutex<Option<ErrorKind>>> = Arc::new(Mutex::new(None));
        let slot: Arc<Mutex<Option<Arc<Delivery>>>> = Arc::new(Mutex::new(None));
        let (seen, me) = (outcome.clone(), slot.clone());
        let handler = move |_id: u32, payload: &[u8], _kind: ResponseKind, finished: bool| {
            if !finished && payload == b"outer" {
                let delivery = me.lock().expect("lock").clone().expect("delivery");
                let kind = delivery
                    .emit(b"inner", ResponseKind::custom())
                    .err()
                    .map(|err| err.kind());
                *seen.lock().expect("lock") = kind;
            }
        };
        let delivery = Arc::new(Delivery::new(2, Box::new(handler)));
        *slot.lock().expect("lock") = Some(delivery.clone());

        delivery.emit(b"outer", ResponseKind::custom()).expect("emit");
        assert_eq!(*outcome.lock().expect("lock"), Some(ErrorKind::ContractViolation));
        assert!(delivery.finish(b"done", ResponseKind::Success));
    }
}
