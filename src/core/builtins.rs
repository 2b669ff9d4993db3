//! Purpose: `client.*` functions every engine-level table can carry.
//! Exports: `register`, `VERSION`.
//! Invariants: Results are JSON objects; field names are additive-only.
use super::error::Error;
use super::function::{Call, FunctionTable, Reply};
use serde_json::json;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) fn register(table: &mut FunctionTable) {
    table
        .register_blocking("client.version", version)
        .register_blocking("client.build_info", build_info)
        .register_blocking("client.get_api_reference", api_reference);
}

fn version(_call: Call) -> Result<Reply, Error> {
    Reply::json(&json!({ "version": VERSION }))
}

fn build_info(_call: Call) -> Result<Reply, Error> {
    Reply::json(&json!({ "build_number": 0, "dependencies": [] }))
}

fn api_reference(call: Call) -> Result<Reply, Error> {
    let functions = call.functions().names().collect::<Vec<_>>();
    Reply::json(&json!({
        "api": {
            "version": VERSION,
            "functions": functions,
        }
    }))
}
