//! Purpose: One execution scope: dispatch table, config, and in-flight requests.
//! Exports: `Context`, `InflightKey`.
//! Invariants: A request key is pending at most once per context; a key whose
//! terminal has been committed is free for reuse even before its entry is removed.
//! Invariants: Once closed, a context admits nothing and its table is drained exactly once.
use super::error::{Error, ErrorKind};
use super::function::{Function, FunctionTable};
use super::invoker::Delivery;
use super::slots::SlotKey;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;

/// Key of a pending request. Synchronous calls use an engine-issued sequence
/// number (wrapping) so they never collide with caller-chosen ids.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum InflightKey {
    Caller(u32),
    Internal(u32),
}

impl InflightKey {
    /// Id reported to handlers.
    pub fn request_id(self) -> u32 {
        match self {
            InflightKey::Caller(id) | InflightKey::Internal(id) => id,
        }
    }
}

pub(crate) struct InflightEntry {
    pub(crate) delivery: Arc<Delivery>,
    pub(crate) abort: Option<AbortHandle>,
}

#[derive(Default)]
struct Inflight {
    closed: bool,
    entries: HashMap<InflightKey, InflightEntry>,
}

pub struct Context {
    key: SlotKey,
    config: Bytes,
    functions: Arc<FunctionTable>,
    inflight: Mutex<Inflight>,
}

impl Context {
    pub(crate) fn new(key: SlotKey, config: Bytes, functions: Arc<FunctionTable>) -> Self {
        Self {
            key,
            config,
            functions,
            inflight: Mutex::new(Inflight::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.key.id
    }

    pub(crate) fn key(&self) -> SlotKey {
        self.key
    }

    pub fn config(&self) -> &Bytes {
        &self.config
    }

    pub(crate) fn functions(&self) -> &Arc<FunctionTable> {
        &self.functions
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Function>, Error> {
        self.functions.resolve(name).ok_or_else(|| {
            Error::new(ErrorKind::UnknownFunction)
                .with_message(format!("unknown function: {name}"))
                .with_context_id(self.id())
        })
    }

    pub fn inflight_len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn register_inflight(
        &self,
        key: InflightKey,
        delivery: Arc<Delivery>,
    ) -> Result<(), Error> {
        let mut inflight = self.lock();
        if inflight.closed {
            return Err(Error::new(ErrorKind::ContextDestroyed)
                .with_context_id(self.id())
                .with_request_id(key.request_id()));
        }
        let pending = inflight
            .entries
            .get(&key)
            .is_some_and(|entry| entry.delivery.is_open());
        if pending {
            return Err(Error::new(ErrorKind::DuplicateRequest)
                .with_context_id(self.id())
                .with_request_id(key.request_id()));
        }
        inflight.entries.insert(
            key,
            InflightEntry {
                delivery,
                abort: None,
            },
        );
        Ok(())
    }

    /// Records how to stop the running task. If the request was already
    /// drained by a destroy, the task is aborted on the spot.
    pub(crate) fn attach_abort(&self, key: InflightKey, delivery: &Arc<Delivery>, abort: AbortHandle) {
        let mut inflight = self.lock();
        let closed = inflight.closed;
        match inflight.entries.get_mut(&key) {
            Some(entry) if Arc::ptr_eq(&entry.delivery, delivery) => entry.abort = Some(abort),
            _ if closed => abort.abort(),
            _ => {}
        }
    }

    pub(crate) fn complete_inflight(
        &self,
        key: InflightKey,
        delivery: &Arc<Delivery>,
    ) -> Result<(), Error> {
        let mut inflight = self.lock();
        match inflight.entries.get(&key) {
            Some(entry) if Arc::ptr_eq(&entry.delivery, delivery) => {
                inflight.entries.remove(&key);
                Ok(())
            }
            _ => Err(Error::new(ErrorKind::UnknownRequest)
                .with_context_id(self.id())
                .with_request_id(key.request_id())),
        }
    }

    /// Stops admission and hands back every pending request.
    pub(crate) fn close(&self) -> Vec<InflightEntry> {
        let mut inflight = self.lock();
        inflight.closed = true;
        inflight.entries.drain().map(|(_, entry)| entry).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inflight> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{Context, InflightKey};
    use crate::core::error::ErrorKind;
    use crate::core::function::FunctionTable;
    use crate::core::invoker::Delivery;
    use crate::core::kind::ResponseKind;
    use crate::core::slots::SlotKey;
    use bytes::Bytes;
    use std::sync::Arc;

    fn context() -> Context {
        Context::new(
            SlotKey {
                id: 1,
                generation: 0,
            },
            Bytes::new(),
            Arc::new(FunctionTable::with_builtins()),
        )
    }

    fn delivery(id: u32) -> Arc<Delivery> {
        let noop = |_: u32, _: &[u8], _: ResponseKind, _: bool| {};
        Arc::new(Delivery::new(id, Box::new(noop)))
    }

    #[test]
    fn duplicate_pending_id_is_rejected() {
        let ctx = context();
        let first = delivery(5);
        ctx.register_inflight(InflightKey::Caller(5), first.clone())
            .expect("first");
        let err = ctx
            .register_inflight(InflightKey::Caller(5), delivery(5))
            .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::DuplicateRequest);
        assert_eq!(ctx.inflight_len(), 1);

        ctx.complete_inflight(InflightKey::Caller(5), &first)
            .expect("complete");
        ctx.register_inflight(InflightKey::Caller(5), delivery(5))
            .expect("id reusable after completion");
    }

    #[test]
    fn complete_unknown_request_fails() {
        let ctx = context();
        let err = ctx
            .complete_inflight(InflightKey::Caller(9), &delivery(9))
            .expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::UnknownRequest);
    }

    #[test]
    fn caller_and_internal_keys_do_not_collide() {
        let ctx = context();
        ctx.register_inflight(InflightKey::Caller(1), delivery(1))
            .expect("caller");
        ctx.register_inflight(InflightKey::Internal(1), delivery(1))
            .expect("internal");
        assert_eq!(ctx.inflight_len(), 2);
        assert_eq!(InflightKey::Internal(u32::MAX).request_id(), u32::MAX);
    }

    #[test]
    fn closed_context_drains_and_rejects() {
        let ctx = context();
        ctx.register_inflight(InflightKey::Caller(1), delivery(1))
            .expect("register");
        let drained = ctx.close();
        assert_eq!(drained.len(), 1);
        assert!(ctx.is_closed());
        let err = ctx
            .register_inflight(InflightKey::Caller(2), delivery(2))
            .expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::ContextDestroyed);
    }

    #[test]
    fn resolve_unknown_function() {
        let ctx = context();
        assert!(ctx.resolve("client.version").is_ok());
        let err = ctx.resolve("nope").err().expect("unknown");
        assert_eq!(err.kind(), ErrorKind::UnknownFunction);
    }

    #[test]
    fn resolved_entry_does_not_block_reuse() {
        let ctx = context();
        let first = delivery(6);
        ctx.register_inflight(InflightKey::Caller(6), first.clone())
            .expect("first");
        assert!(first.finish(b"done", ResponseKind::Success));

        let second = delivery(6);
        ctx.register_inflight(InflightKey::Caller(6), second.clone())
            .expect("reuse before completion");
        assert_eq!(ctx.inflight_len(), 1);

        let err = ctx
            .complete_inflight(InflightKey::Caller(6), &first)
            .expect_err("replaced entry");
        assert_eq!(err.kind(), ErrorKind::UnknownRequest);
        assert_eq!(ctx.inflight_len(), 1, "new entry survives the old completion");
        ctx.complete_inflight(InflightKey::Caller(6), &second)
            .expect("complete second");
    }
}
