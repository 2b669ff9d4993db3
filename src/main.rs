//! Purpose: `ctxcall` CLI entry point for driving the dispatch engine by hand.
//! Role: Binary crate root; parses args, runs commands, emits JSON lines on stdout.
//! Invariants: Each delivered payload is one JSON line on stdout, terminal last.
//! Invariants: CLI-level errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::error_code`.
use std::io::{self, IsTerminal};

use clap::{CommandFactory, Parser, Subcommand, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use ctxcall::api::{Error, ErrorKind, ResponseKind, error_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            error_code(err.kind()) as i32
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `ctxcall --help` for usage."));
            }
        },
    };

    init_tracing();
    command_dispatch::dispatch_command(cli.command, cli.worker_threads)
}

#[derive(Parser)]
#[command(
    name = "ctxcall",
    version,
    about = "Call named functions through a ctxcall context",
    long_about = None,
    after_help = r#"EXAMPLES
  $ ctxcall call client.version
  $ ctxcall call client.get_api_reference --sync
  $ ctxcall functions

Set RUST_LOG=debug to see dispatch diagnostics on stderr."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(long, help = "Worker threads for the engine runtime (default: one per core)")]
    worker_threads: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Call a function and print every delivered payload",
        after_help = r#"EXAMPLES
  $ ctxcall call client.version
  $ ctxcall call client.build_info --sync
  $ ctxcall call client.version --config '{"network":"local"}' --request-id 7"#
    )]
    Call {
        #[arg(help = "Function name, e.g. client.version")]
        function: String,
        #[arg(long, default_value = "", help = "Params payload (passed through as bytes)")]
        params: String,
        #[arg(long, default_value = "", help = "Context config payload (opaque)")]
        config: String,
        #[arg(long, help = "Use the blocking call; only the terminal payload is printed")]
        sync: bool,
        #[arg(long, default_value_t = 1, help = "Request id for the asynchronous call")]
        request_id: u32,
    },
    #[command(about = "List the functions a new context can call")]
    Functions,
    #[command(about = "Print version info as JSON")]
    Version,
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.render().to_string();
    rendered
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim_start_matches("error: ").trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

/// One stdout line per delivered payload.
fn payload_line(request_id: u32, kind: ResponseKind, finished: bool, payload: &[u8]) -> Value {
    json!({
        "request_id": request_id,
        "kind": kind.label(),
        "code": kind.code(),
        "finished": finished,
        "payload": payload_value(payload),
    })
}

fn payload_value(payload: &[u8]) -> Value {
    if payload.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}

fn emit_json(value: Value) {
    println!("{value}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        let mut line = format!("error: {err}");
        if let Some(hint) = err.hint() {
            line.push_str(&format!("\nhint: {hint}"));
        }
        eprintln!("{line}");
        return;
    }
    let mut outer = Map::new();
    outer.insert("error".to_string(), err.to_json());
    eprintln!("{}", Value::Object(outer));
}

fn completion(shell: Shell) {
    let mut cmd = Cli::command();
    clap_complete::aot::generate(shell, &mut cmd, "ctxcall", &mut io::stdout());
}
