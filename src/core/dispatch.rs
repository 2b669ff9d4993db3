//! Purpose: Admit requests against contexts, run them, and resolve each exactly once.
//! Exports: `Engine`, `ContextHandle`.
//! Role: Request dispatcher plus the blocking adapter layered on top of it.
//! Invariants: Every submission yields exactly one terminal payload, including rejections.
//! Invariants: Validation (context, function, request id) happens on the caller's thread;
//! execution happens on the engine's worker runtime.
//! Invariants: The blocking adapter discards intermediate payloads.
use super::buffer::Buffer;
use super::context::{Context, InflightKey};
use super::error::{Error, ErrorKind};
use super::function::{Call, FunctionTable, Reply, ResponseSink};
use super::invoker::{Delivery, ResponseHandler};
use super::kind::ResponseKind;
use super::options::EngineOptions;
use super::registry::ContextRegistry;
use super::slots::SlotKey;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{SyncSender, sync_channel};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};

/// Opaque reference to a live context. Carries a generation so a handle to
/// a destroyed context never resolves to a later context reusing its id.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ContextHandle {
    key: SlotKey,
}

impl ContextHandle {
    pub fn id(&self) -> u32 {
        self.key.id
    }
}

pub struct Engine {
    runtime: Option<Runtime>,
    handle: Handle,
    registry: ContextRegistry,
    functions: Arc<FunctionTable>,
    next_internal: AtomicU32,
}

impl Engine {
    pub fn new(functions: FunctionTable) -> Result<Self, Error> {
        Self::with_options(functions, EngineOptions::new())
    }

    pub fn with_options(functions: FunctionTable, options: EngineOptions) -> Result<Self, Error> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name(options.thread_name.clone());
        if let Some(threads) = options.worker_threads {
            builder.worker_threads(threads);
        }
        let runtime = builder.build().map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            registry: ContextRegistry::new(options.max_contexts),
            functions: Arc::new(functions),
            next_internal: AtomicU32::new(1),
        })
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    pub fn create_context(&self, config: impl Into<Bytes>) -> Result<ContextHandle, Error> {
        let context = self
            .registry
            .create(config.into(), self.functions.clone())?;
        Ok(ContextHandle { key: context.key() })
    }

    /// Destroys by raw id. Unknown ids are ignored; returns whether a context was torn down.
    pub fn destroy_context(&self, id: u32) -> bool {
        self.registry.destroy(id)
    }

    pub fn destroy(&self, handle: ContextHandle) -> bool {
        self.registry.destroy_key(handle.key)
    }

    pub fn is_live(&self, handle: ContextHandle) -> bool {
        self.registry.get_key(handle.key).is_some()
    }

    pub fn context_count(&self) -> usize {
        self.registry.len()
    }

    /// Pending requests on a live context.
    pub fn inflight(&self, id: u32) -> Option<usize> {
        self.registry.get(id).map(|context| context.inflight_len())
    }

    /// Fire-and-forget submission; every outcome arrives through `handler`.
    pub fn request(
        &self,
        context_id: u32,
        function: &str,
        params: impl Into<Bytes>,
        request_id: u32,
        handler: impl ResponseHandler,
    ) {
        self.submit(
            context_id,
            function,
            params.into(),
            InflightKey::Caller(request_id),
            Box::new(handler),
        );
    }

    /// Blocks until the terminal payload arrives and returns its bytes.
    /// Safe to call from inside another request's handler.
    pub fn request_sync(&self, context_id: u32, function: &str, params: impl Into<Bytes>) -> Buffer {
        let (tx, rx) = sync_channel(1);
        // Wraps on overflow; sync keys live in their own namespace.
        let seq = self.next_internal.fetch_add(1, Ordering::Relaxed);
        self.submit(
            context_id,
            function,
            params.into(),
            InflightKey::Internal(seq),
            Box::new(TerminalCollector {
                tx: Mutex::new(Some(tx)),
            }),
        );
        match block_waiting(|| rx.recv()) {
            Ok(buffer) => buffer,
            Err(_) => {
                let err = Error::new(ErrorKind::Internal)
                    .with_message("request ended without a terminal payload")
                    .with_context_id(context_id);
                Buffer::new(err.to_payload(), ResponseKind::Error)
            }
        }
    }

    fn submit(
        &self,
        context_id: u32,
        function: &str,
        params: Bytes,
        key: InflightKey,
        handler: Box<dyn ResponseHandler>,
    ) {
        let delivery = Arc::new(Delivery::new(key.request_id(), handler));

        let Some(context) = self.registry.get(context_id) else {
            reject(
                &delivery,
                Error::new(ErrorKind::InvalidContext)
                    .with_message(format!("invalid context: {context_id}"))
                    .with_context_id(context_id),
            );
            return;
        };
        let target = match context.resolve(function) {
            Ok(target) => target,
            Err(err) => return reject(&delivery, tag(err, &context, key)),
        };
        if let Err(err) = context.register_inflight(key, delivery.clone()) {
            return reject(&delivery, err);
        }

        let call = Call {
            context_id,
            request_id: key.request_id(),
            function: function.to_string(),
            params,
            config: context.config().clone(),
            functions: context.functions().clone(),
            sink: ResponseSink::new(delivery.clone()),
        };
        let task = self.handle.spawn(target.call(call));
        context.attach_abort(key, &delivery, task.abort_handle());

        let name = function.to_string();
        self.handle.spawn(async move {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(err) if err.is_cancelled() => return,
                Err(err) => {
                    tracing::error!(
                        context = context.id(),
                        request_id = key.request_id(),
                        function = %name,
                        "function panicked"
                    );
                    Err(Error::new(ErrorKind::Internal)
                        .with_message(format!("function {name} panicked"))
                        .with_source(err))
                }
            };
            resolve(&context, key, &delivery, outcome);
        });
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for id in self.registry.ids() {
            self.registry.destroy(id);
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn reject(delivery: &Delivery, err: Error) {
    tracing::debug!(
        request_id = delivery.request_id(),
        kind = ?err.kind(),
        "request rejected"
    );
    delivery.finish(&err.to_payload(), ResponseKind::Error);
}

fn resolve(context: &Context, key: InflightKey, delivery: &Arc<Delivery>, outcome: Result<Reply, Error>) {
    let (payload, kind) = match outcome {
        Ok(Reply::Success(bytes)) => (bytes, ResponseKind::Success),
        Ok(Reply::End) => (Vec::new(), ResponseKind::End),
        Err(err) => (tag(err, context, key).to_payload(), ResponseKind::Error),
    };
    delivery.finish(&payload, kind);
    // The key may already belong to a reused request, or the context was torn down.
    if context.complete_inflight(key, delivery).is_err() {
        tracing::debug!(
            context = context.id(),
            request_id = key.request_id(),
            closed = context.is_closed(),
            "resolved request no longer pending"
        );
    }
}

fn tag(mut err: Error, context: &Context, key: InflightKey) -> Error {
    if err.context_id().is_none() {
        err = err.with_context_id(context.id());
    }
    if let (None, InflightKey::Caller(id)) = (err.request_id(), key) {
        err = err.with_request_id(id);
    }
    err
}

struct TerminalCollector {
    tx: Mutex<Option<SyncSender<Buffer>>>,
}

impl ResponseHandler for TerminalCollector {
    fn on_response(&self, _request_id: u32, payload: &[u8], kind: ResponseKind, finished: bool) {
        if !finished {
            return;
        }
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(Buffer::new(payload.to_vec(), kind));
        }
    }
}

/// Runs a blocking wait without starving a runtime worker we may be running on.
fn block_waiting<T>(wait: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    }
}

#[cfg(test)]
mod tests {
    use super::Engine;
    use crate::core::error::ErrorKind;
    use crate::core::function::{FunctionTable, Reply};
    use crate::core::kind::ResponseKind;
    use crate::core::options::EngineOptions;
    use std::sync::mpsc;
    use std::time::Duration;

    fn engine(table: FunctionTable) -> Engine {
        Engine::with_options(table, EngineOptions::new().with_worker_threads(2)).expect("engine")
    }

    #[test]
    fn sync_request_returns_builtin_result() {
        let engine = engine(FunctionTable::with_builtins());
        let ctx = engine.create_context(Vec::new()).expect("context");
        let buffer = engine.request_sync(ctx.id(), "client.version", Vec::new());
        assert_eq!(buffer.kind(), ResponseKind::Success);
        let value: serde_json::Value = serde_json::from_slice(buffer.as_bytes()).expect("json");
        assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn function_error_is_tagged_terminal() {
        let mut table = FunctionTable::new();
        table.register_blocking("fail", |call| {
            Err(crate::core::error::Error::new(ErrorKind::InvalidParams)
                .with_message(format!("bad params for {}", call.function())))
        });
        let engine = engine(table);
        let ctx = engine.create_context(Vec::new()).expect("context");

        let (tx, rx) = mpsc::channel();
        let handler = move |id: u32, payload: &[u8], kind: ResponseKind, finished: bool| {
            let _ = tx.send((id, payload.to_vec(), kind, finished));
        };
        engine.request(ctx.id(), "fail", Vec::new(), 11, handler);
        let (id, payload, kind, finished) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("terminal");
        assert_eq!((id, kind, finished), (11, ResponseKind::Error, true));
        let value: serde_json::Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(value["kind"], "InvalidParams");
        assert_eq!(value["request_id"], 11);
        assert_eq!(value["context_id"], ctx.id());
    }

    #[test]
    fn end_reply_has_empty_payload() {
        let mut table = FunctionTable::new();
        table.register_async("stream.done", |_call| async { Ok(Reply::End) });
        let engine = engine(table);
        let ctx = engine.create_context(Vec::new()).expect("context");
        let buffer = engine.request_sync(ctx.id(), "stream.done", Vec::new());
        assert_eq!(buffer.kind(), ResponseKind::End);
        assert!(buffer.is_empty());
    }

    #[test]
    fn panicking_function_still_terminates() {
        let mut table = FunctionTable::new();
        table.register_blocking("boom", |_call| -> Result<Reply, crate::core::error::Error> {
            panic!("boom")
        });
        let engine = engine(table);
        let ctx = engine.create_context(Vec::new()).expect("context");
        let buffer = engine.request_sync(ctx.id(), "boom", Vec::new());
        assert_eq!(buffer.kind(), ResponseKind::Error);
        let value: serde_json::Value = serde_json::from_slice(buffer.as_bytes()).expect("json");
        assert_eq!(value["kind"], "Internal");
    }

    #[test]
    fn stale_handle_is_not_live() {
        let engine = engine(FunctionTable::with_builtins());
        let first = engine.create_context(Vec::new()).expect("context");
        assert!(engine.destroy(first));
        let second = engine.create_context(Vec::new()).expect("context");
        assert_eq!(first.id(), second.id());
        assert!(!engine.is_live(first));
        assert!(engine.is_live(second));
        assert!(!engine.destroy(first));
        assert_eq!(engine.context_count(), 1);
    }
}
