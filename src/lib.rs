//! Purpose: Context-scoped request dispatch engine behind a C ABI.
//! Exports: `api` (engine, contexts, functions, handlers, buffers), `abi` (C surface).
//! Role: Library backing the `ctxcall` binary and `libctxcall` for bindings.
//! Invariants: One terminal payload per request; buffers live until explicitly released.
pub mod abi;
pub mod api;
pub(crate) mod core;
