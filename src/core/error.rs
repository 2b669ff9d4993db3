//! Purpose: Structured error model shared by the registry, dispatcher, and ABI.
//! Exports: `Error`, `ErrorKind`, `error_code`, `Error::to_payload`.
//! Invariants: Numeric codes are stable once published; new kinds append.
//! Invariants: `ContractViolation` marks producer/caller bugs, never a recoverable outcome.
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    InvalidContext,
    UnknownFunction,
    DuplicateRequest,
    UnknownRequest,
    ContextDestroyed,
    ContractViolation,
    InvalidParams,
    Usage,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    request_id: Option<u32>,
    context_id: Option<u32>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            request_id: None,
            context_id: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn request_id(&self) -> Option<u32> {
        self.request_id
    }

    pub fn context_id(&self) -> Option<u32> {
        self.context_id
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_request_id(mut self, request_id: u32) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_context_id(mut self, context_id: u32) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// JSON object describing this error, as delivered in terminal error payloads.
    pub fn to_json(&self) -> Value {
        let mut inner = Map::new();
        inner.insert("code".to_string(), json!(error_code(self.kind)));
        inner.insert("kind".to_string(), json!(format!("{:?}", self.kind)));
        inner.insert(
            "message".to_string(),
            json!(self.message.as_deref().unwrap_or_else(|| default_message(self.kind))),
        );
        if let Some(hint) = &self.hint {
            inner.insert("hint".to_string(), json!(hint));
        }
        if let Some(request_id) = self.request_id {
            inner.insert("request_id".to_string(), json!(request_id));
        }
        if let Some(context_id) = self.context_id {
            inner.insert("context_id".to_string(), json!(context_id));
        }
        if let Some(source) = &self.source {
            inner.insert("cause".to_string(), json!(source.to_string()));
        }
        Value::Object(inner)
    }

    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_json()).unwrap_or_else(|_| {
            format!(
                "{{\"code\":{},\"kind\":\"{:?}\",\"message\":\"error encode failed\"}}",
                error_code(self.kind),
                self.kind
            )
            .into_bytes()
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(context_id) = self.context_id {
            write!(f, " (context: {context_id})")?;
        }
        if let Some(request_id) = self.request_id {
            write!(f, " (request: {request_id})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn error_code(kind: ErrorKind) -> u32 {
    match kind {
        ErrorKind::InvalidContext => 1,
        ErrorKind::UnknownFunction => 2,
        ErrorKind::DuplicateRequest => 3,
        ErrorKind::UnknownRequest => 4,
        ErrorKind::ContextDestroyed => 5,
        ErrorKind::ContractViolation => 6,
        ErrorKind::InvalidParams => 7,
        ErrorKind::Usage => 8,
        ErrorKind::Internal => 9,
    }
}

fn default_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidContext => "invalid context",
        ErrorKind::UnknownFunction => "unknown function",
        ErrorKind::DuplicateRequest => "request id already pending on this context",
        ErrorKind::UnknownRequest => "request id is not pending on this context",
        ErrorKind::ContextDestroyed => "context destroyed",
        ErrorKind::ContractViolation => "contract violation",
        ErrorKind::InvalidParams => "invalid params",
        ErrorKind::Usage => "usage error",
        ErrorKind::Internal => "internal error",
    }
}
