//! Purpose: Define the stable public Rust API boundary for ctxcall.
//! Exports: Engine, contexts, functions, handlers, buffers, and errors.
//! Role: Public, additive-only surface; hides internal bookkeeping modules.
//! Invariants: The CLI goes through this module only; the C ABI also reaches the buffer arena.

mod stream;

pub use crate::core::buffer::Buffer;
pub use crate::core::builtins::VERSION;
pub use crate::core::dispatch::{ContextHandle, Engine};
pub use crate::core::error::{Error, ErrorKind, error_code};
pub use crate::core::function::{BoxFuture, Call, Function, FunctionTable, Reply, ResponseSink};
pub use crate::core::invoker::ResponseHandler;
pub use crate::core::kind::{CUSTOM_BASE, ResponseKind};
pub use crate::core::options::{ENV_MAX_CONTEXTS, ENV_WORKER_THREADS, EngineOptions};
pub use stream::{ResponseEvent, ResponseStream};
