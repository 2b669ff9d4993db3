//! Purpose: Hold top-level CLI command dispatch for `ctxcall`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: A `call` whose terminal payload is an error exits non-zero.

use super::*;
use ctxcall::api::{Engine, EngineOptions, FunctionTable, VERSION};
use tokio_stream::StreamExt;

pub(super) fn dispatch_command(
    command: Command,
    worker_threads: Option<usize>,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            completion(shell);
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_json(json!({ "name": "ctxcall", "version": VERSION }));
            Ok(RunOutcome::ok())
        }
        Command::Functions => {
            let table = FunctionTable::with_builtins();
            let names = table.names().collect::<Vec<_>>();
            emit_json(json!({ "functions": names }));
            Ok(RunOutcome::ok())
        }
        Command::Call {
            function,
            params,
            config,
            sync,
            request_id,
        } => {
            let engine = open_engine(worker_threads)?;
            let context = engine.create_context(config.into_bytes())?;
            let terminal = if sync {
                let buffer = engine.request_sync(context.id(), &function, params.into_bytes());
                emit_json(payload_line(0, buffer.kind(), true, buffer.as_bytes()));
                (buffer.kind(), buffer.into_vec())
            } else {
                stream_call(&engine, context.id(), &function, params, request_id)?
            };
            engine.destroy(context);
            Ok(terminal_outcome(terminal.0, &terminal.1))
        }
    }
}

fn open_engine(worker_threads: Option<usize>) -> Result<Engine, Error> {
    let mut options = EngineOptions::from_env()?;
    if let Some(threads) = worker_threads {
        options = options.with_worker_threads(threads);
    }
    Engine::with_options(FunctionTable::with_builtins(), options)
}

fn stream_call(
    engine: &Engine,
    context_id: u32,
    function: &str,
    params: String,
    request_id: u32,
) -> Result<(ResponseKind, Vec<u8>), Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    let mut stream = engine.request_stream(context_id, function, params.into_bytes(), request_id);
    runtime.block_on(async move {
        while let Some(event) = stream.next().await {
            emit_json(payload_line(
                event.request_id,
                event.kind,
                event.finished,
                &event.payload,
            ));
            if event.finished {
                return Ok((event.kind, event.payload.to_vec()));
            }
        }
        Err(Error::new(ErrorKind::Internal).with_message("stream ended without a terminal payload"))
    })
}

fn terminal_outcome(kind: ResponseKind, payload: &[u8]) -> RunOutcome {
    if kind != ResponseKind::Error {
        return RunOutcome::ok();
    }
    let code = serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|value| value.get("code").and_then(Value::as_i64))
        .unwrap_or(1);
    RunOutcome::with_code(code as i32)
}

#[cfg(test)]
mod tests {
    use super::terminal_outcome;
    use ctxcall::api::ResponseKind;

    #[test]
    fn error_terminal_maps_to_code() {
        let outcome = terminal_outcome(ResponseKind::Error, br#"{"code":2,"kind":"UnknownFunction"}"#);
        assert_eq!(outcome.exit_code, 2);
        assert_eq!(terminal_outcome(ResponseKind::Success, b"{}").exit_code, 0);
        assert_eq!(terminal_outcome(ResponseKind::Error, b"garbage").exit_code, 1);
    }
}
