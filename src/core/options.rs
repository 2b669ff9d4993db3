//! Purpose: Engine-level configuration (worker pool and registry limits).
//! Exports: `EngineOptions`, `ENV_WORKER_THREADS`, `ENV_MAX_CONTEXTS`.
//! Invariants: Context configuration is separate and stays opaque to the engine.
use super::error::{Error, ErrorKind};

pub const ENV_WORKER_THREADS: &str = "CTXCALL_WORKER_THREADS";
pub const ENV_MAX_CONTEXTS: &str = "CTXCALL_MAX_CONTEXTS";

const DEFAULT_MAX_CONTEXTS: u32 = 65_535;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EngineOptions {
    /// Runtime worker threads; `None` uses the runtime default (one per core).
    pub worker_threads: Option<usize>,
    pub thread_name: String,
    pub max_contexts: u32,
}

impl EngineOptions {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: "ctxcall-worker".to_string(),
            max_contexts: DEFAULT_MAX_CONTEXTS,
        }
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads.max(1));
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_max_contexts(mut self, max_contexts: u32) -> Self {
        self.max_contexts = max_contexts;
        self
    }

    /// Defaults overridden by `CTXCALL_WORKER_THREADS` / `CTXCALL_MAX_CONTEXTS`.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut options = Self::new();
        if let Some(raw) = lookup(ENV_WORKER_THREADS) {
            options = options.with_worker_threads(parse_env(ENV_WORKER_THREADS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_MAX_CONTEXTS) {
            options = options.with_max_contexts(parse_env(ENV_MAX_CONTEXTS, &raw)?);
        }
        Ok(options)
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, Error>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim().parse::<T>().map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid {key}: {raw:?}"))
            .with_hint("Use a positive integer.")
            .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::{ENV_MAX_CONTEXTS, ENV_WORKER_THREADS, EngineOptions};
    use crate::core::error::ErrorKind;

    #[test]
    fn lookup_overrides_defaults() {
        let options = EngineOptions::from_lookup(|key| match key {
            ENV_WORKER_THREADS => Some("3".to_string()),
            ENV_MAX_CONTEXTS => Some(" 10 ".to_string()),
            _ => None,
        })
        .expect("options");
        assert_eq!(options.worker_threads, Some(3));
        assert_eq!(options.max_contexts, 10);
    }

    #[test]
    fn invalid_value_is_usage_error() {
        let err = EngineOptions::from_lookup(|key| {
            (key == ENV_WORKER_THREADS).then(|| "many".to_string())
        })
        .expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn worker_threads_floor_is_one() {
        assert_eq!(EngineOptions::new().with_worker_threads(0).worker_threads, Some(1));
    }
}
