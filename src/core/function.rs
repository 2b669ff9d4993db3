//! Purpose: Named executable behaviors and the per-call surface they see.
//! Exports: `Function`, `FunctionTable`, `Call`, `ResponseSink`, `Reply`, `BoxFuture`.
//! Role: The dispatch table a context resolves function names against.
//! Invariants: A function produces its terminal outcome only by returning;
//! intermediates go through `ResponseSink`, so a second terminal cannot be expressed.
use super::error::{Error, ErrorKind};
use super::invoker::Delivery;
use super::kind::ResponseKind;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Terminal outcome of a successful call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    Success(Vec<u8>),
    /// Terminal with no payload bytes.
    End,
}

impl Reply {
    pub fn success(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Success(bytes.into())
    }

    pub fn json(value: &serde_json::Value) -> Result<Self, Error> {
        serde_json::to_vec(value).map(Reply::Success).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode result")
                .with_source(err)
        })
    }
}

pub trait Function: Send + Sync + 'static {
    fn call(&self, call: Call) -> BoxFuture<Result<Reply, Error>>;
}

struct AsyncFn<F>(F);

impl<F, Fut> Function for AsyncFn<F>
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, Error>> + Send + 'static,
{
    fn call(&self, call: Call) -> BoxFuture<Result<Reply, Error>> {
        Box::pin((self.0)(call))
    }
}

struct BlockingFn<F>(Arc<F>);

impl<F> Function for BlockingFn<F>
where
    F: Fn(Call) -> Result<Reply, Error> + Send + Sync + 'static,
{
    fn call(&self, call: Call) -> BoxFuture<Result<Reply, Error>> {
        let f = self.0.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || f(call))
                .await
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("blocking function did not complete")
                        .with_source(err)
                })?
        })
    }
}

/// Name-to-behavior dispatch table.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: BTreeMap<String, Arc<dyn Function>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table preloaded with the `client.*` functions.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        super::builtins::register(&mut table);
        table
    }

    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn Function>) -> &mut Self {
        self.functions.insert(name.into(), function);
        self
    }

    pub fn register_async<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        self.register(name, Arc::new(AsyncFn(f)))
    }

    /// Registers a synchronous function; it runs on the blocking pool.
    pub fn register_blocking<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Call) -> Result<Reply, Error> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(BlockingFn(Arc::new(f))))
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Emits intermediate payloads for one request.
#[derive(Clone)]
pub struct ResponseSink {
    delivery: Arc<Delivery>,
}

impl ResponseSink {
    pub(crate) fn new(delivery: Arc<Delivery>) -> Self {
        Self { delivery }
    }

    pub fn emit(&self, payload: impl AsRef<[u8]>) -> Result<(), Error> {
        self.delivery
            .emit(payload.as_ref(), ResponseKind::custom())
    }

    pub fn emit_kind(&self, kind: ResponseKind, payload: impl AsRef<[u8]>) -> Result<(), Error> {
        if !kind.is_custom() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("intermediate payloads must use a custom kind")
                .with_hint("Return the terminal outcome from the function instead."));
        }
        self.delivery.emit(payload.as_ref(), kind)
    }

    pub fn emit_json(&self, value: &serde_json::Value) -> Result<(), Error> {
        let bytes = serde_json::to_vec(value).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode payload")
                .with_source(err)
        })?;
        self.emit(bytes)
    }

    /// False once the request has been resolved or cancelled.
    pub fn is_open(&self) -> bool {
        self.delivery.is_open()
    }
}

/// Everything a function receives for one invocation.
pub struct Call {
    pub(crate) context_id: u32,
    pub(crate) request_id: u32,
    pub(crate) function: String,
    pub(crate) params: Bytes,
    pub(crate) config: Bytes,
    pub(crate) functions: Arc<FunctionTable>,
    pub(crate) sink: ResponseSink,
}

impl Call {
    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn params(&self) -> &Bytes {
        &self.params
    }

    /// Opaque configuration supplied when the context was created.
    pub fn config(&self) -> &Bytes {
        &self.config
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    pub fn sink(&self) -> &ResponseSink {
        &self.sink
    }

    /// Decodes params as JSON; empty params decode as `null`.
    pub fn params_json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let bytes: &[u8] = if self.params.is_empty() {
            b"null"
        } else {
            &self.params
        };
        serde_json::from_slice(bytes).map_err(|err| {
            Error::new(ErrorKind::InvalidParams)
                .with_message(format!("invalid params for {}", self.function))
                .with_source(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{FunctionTable, Reply};

    #[test]
    fn table_resolves_registered_names() {
        let mut table = FunctionTable::new();
        table
            .register_blocking("math.zero", |_call| Ok(Reply::success(b"0".to_vec())))
            .register_async("math.one", |_call| async { Ok(Reply::success(b"1".to_vec())) });
        assert!(table.resolve("math.zero").is_some());
        assert!(table.resolve("math.one").is_some());
        assert!(table.resolve("math.two").is_none());
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["math.one", "math.zero"]);
    }

    #[test]
    fn builtins_are_registered() {
        let table = FunctionTable::with_builtins();
        assert!(table.contains("client.version"));
        assert!(table.contains("client.build_info"));
        assert!(table.contains("client.get_api_reference"));
    }

    #[test]
    fn reply_json_encodes_value() {
        let reply = Reply::json(&serde_json::json!({"ok": true})).expect("json");
        assert_eq!(reply, Reply::Success(br#"{"ok":true}"#.to_vec()));
    }
}
