// Core modules implementing the registry, dispatch, delivery, and buffer ownership.
pub mod buffer;
pub mod builtins;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod function;
pub mod invoker;
pub mod kind;
pub mod options;
pub mod registry;
pub mod slots;
