//! Purpose: C ABI bridge for bindings (libctxcall).
//! Exports: `tc_create_context`, `tc_destroy_context`, `tc_request`, `tc_request_sync`,
//! `tc_read_string`, `tc_read_string_kind`, `tc_destroy_string`.
//! Role: Stable ABI surface over one process-wide `Engine` with the builtin functions.
//! Invariants: Byte payloads in/out; opaque string handles; explicit destroy.
//! Invariants: Every `tc_request` with a non-null handler gets exactly one terminal callback.
//! Invariants: Callback payload views are valid only for the duration of the callback.
#![allow(non_camel_case_types)]

use crate::api::{Buffer, Engine, EngineOptions, Error, ErrorKind, FunctionTable, ResponseKind};
use crate::core::buffer::arena;
use libc::c_char;
use serde_json::json;
use std::ptr;
use std::sync::OnceLock;

pub const ENV_LOG: &str = "CTXCALL_LOG";

#[repr(C)]
#[derive(Clone, Copy)]
pub struct tc_string_data_t {
    pub content: *const c_char,
    pub len: u32,
}

/// Opaque to C; only ever seen behind a pointer.
pub type tc_string_handle_t = Buffer;

pub type tc_response_handler_t = Option<
    extern "C" fn(request_id: u32, params_json: tc_string_data_t, response_type: u32, finished: bool),
>;

#[unsafe(no_mangle)]
pub extern "C" fn tc_create_context(config: tc_string_data_t) -> *mut tc_string_handle_t {
    let envelope = match engine() {
        Ok(engine) => match engine.create_context(unsafe { bytes_of(config) }.to_vec()) {
            Ok(handle) => Buffer::new(envelope_result(handle.id()), ResponseKind::Success),
            Err(err) => Buffer::new(envelope_error(&err), ResponseKind::Error),
        },
        Err(err) => Buffer::new(envelope_error(&err), ResponseKind::Error),
    };
    arena().publish(envelope)
}

#[unsafe(no_mangle)]
pub extern "C" fn tc_destroy_context(context: u32) {
    if let Ok(engine) = engine() {
        engine.destroy_context(context);
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tc_request(
    context: u32,
    function_name: tc_string_data_t,
    function_params_json: tc_string_data_t,
    request_id: u32,
    response_handler: tc_response_handler_t,
) {
    let Some(callback) = response_handler else {
        tracing::warn!(context, request_id, "tc_request without a response handler ignored");
        return;
    };
    let handler = CallbackHandler { callback };
    let engine = match engine() {
        Ok(engine) => engine,
        Err(err) => return handler.fail(request_id, &err),
    };
    let name = match unsafe { name_of(function_name) } {
        Ok(name) => name,
        Err(err) => return handler.fail(request_id, &err.with_context_id(context)),
    };
    let params = unsafe { bytes_of(function_params_json) }.to_vec();
    engine.request(context, name, params, request_id, handler);
}

#[unsafe(no_mangle)]
pub extern "C" fn tc_request_sync(
    context: u32,
    function_name: tc_string_data_t,
    function_params_json: tc_string_data_t,
) -> *mut tc_string_handle_t {
    let buffer = match (engine(), unsafe { name_of(function_name) }) {
        (Ok(engine), Ok(name)) => {
            let params = unsafe { bytes_of(function_params_json) }.to_vec();
            engine.request_sync(context, name, params)
        }
        (Err(err), _) | (_, Err(err)) => Buffer::new(err.to_payload(), ResponseKind::Error),
    };
    arena().publish(buffer)
}

#[unsafe(no_mangle)]
pub extern "C" fn tc_read_string(handle: *const tc_string_handle_t) -> tc_string_data_t {
    match unsafe { arena().read(handle) } {
        Some(buffer) => tc_string_data_t {
            content: buffer.as_bytes().as_ptr() as *const c_char,
            len: buffer.len() as u32,
        },
        None => tc_string_data_t {
            content: ptr::null(),
            len: 0,
        },
    }
}

/// Response kind code of the payload a handle holds; `tc_response_error` for null.
#[unsafe(no_mangle)]
pub extern "C" fn tc_read_string_kind(handle: *const tc_string_handle_t) -> u32 {
    unsafe { arena().read(handle) }
        .map(|buffer| buffer.kind())
        .unwrap_or(ResponseKind::Error)
        .code()
}

#[unsafe(no_mangle)]
pub extern "C" fn tc_destroy_string(handle: *const tc_string_handle_t) {
    unsafe { arena().destroy(handle) }
}

struct CallbackHandler {
    callback: extern "C" fn(u32, tc_string_data_t, u32, bool),
}

impl CallbackHandler {
    fn fail(&self, request_id: u32, err: &Error) {
        let payload = err.to_payload();
        (self.callback)(request_id, string_data(&payload), ResponseKind::Error.code(), true);
    }
}

impl crate::api::ResponseHandler for CallbackHandler {
    fn on_response(&self, request_id: u32, payload: &[u8], kind: ResponseKind, finished: bool) {
        (self.callback)(request_id, string_data(payload), kind.code(), finished);
    }
}

fn string_data(bytes: &[u8]) -> tc_string_data_t {
    tc_string_data_t {
        content: bytes.as_ptr() as *const c_char,
        len: bytes.len() as u32,
    }
}

unsafe fn bytes_of<'a>(data: tc_string_data_t) -> &'a [u8] {
    if data.content.is_null() || data.len == 0 {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(data.content as *const u8, data.len as usize) }
}

unsafe fn name_of<'a>(data: tc_string_data_t) -> Result<&'a str, Error> {
    let bytes = unsafe { bytes_of(data) };
    std::str::from_utf8(bytes).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("function name is not valid UTF-8")
            .with_source(err)
    })
}

fn envelope_result(id: u32) -> Vec<u8> {
    json!({ "result": id }).to_string().into_bytes()
}

fn envelope_error(err: &Error) -> Vec<u8> {
    json!({ "error": err.to_json() }).to_string().into_bytes()
}

fn engine() -> Result<&'static Engine, Error> {
    static ENGINE: OnceLock<Result<Engine, String>> = OnceLock::new();
    let slot = ENGINE.get_or_init(|| {
        init_tracing();
        EngineOptions::from_env()
            .and_then(|options| Engine::with_options(FunctionTable::with_builtins(), options))
            .map_err(|err| err.to_string())
    });
    slot.as_ref().map_err(|message| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("engine unavailable: {message}"))
    })
}

fn init_tracing() {
    let Ok(directives) = std::env::var(ENV_LOG) else {
        return;
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(directives))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
