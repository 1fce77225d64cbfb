//! Error reporting.
//!
//! Two kinds of failure move through the crate:
//! - Structured configuration/initialization messages, collected in an
//!   [`ErrorSink`] so a whole graph can be checked before deciding whether
//!   it may run. These are non-fatal to the process: the offending router
//!   fails to activate, the master and other routers continue.
//! - Typed API errors ([`MasterError`], [`GraphError`]) for operations with
//!   a single caller that can act on the result.
//!
//! Descriptor registration and thread spawning report `io::Error` directly.

use std::fmt;

use thiserror::Error;

/// Severity of a reported message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// One collected message.
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub severity: Severity,
    /// Usually the name of the element being configured or initialized.
    pub context: Option<String>,
    pub message: String,
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "{}: {}: {}", self.severity, ctx, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// Collects messages with severities across a configuration or
/// initialization pass.
///
/// Elements report into the sink from `configure` and `initialize`; the
/// router inspects [`ErrorSink::num_errors`] after driving every element to
/// decide whether the graph may run. Messages are also forwarded to
/// `tracing` as they arrive.
#[derive(Debug, Default)]
pub struct ErrorSink {
    entries: Vec<ErrorEntry>,
    context: Option<String>,
    nerrors: usize,
    nwarnings: usize,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the context prefixed to subsequent messages, typically an
    /// element name. Cleared with [`ErrorSink::clear_context`].
    pub fn set_context(&mut self, context: impl Into<String>) {
        self.context = Some(context.into());
    }

    pub fn clear_context(&mut self) {
        self.context = None;
    }

    pub fn report(&mut self, severity: Severity, message: impl Into<String>) {
        let entry = ErrorEntry {
            severity,
            context: self.context.clone(),
            message: message.into(),
        };
        match severity {
            Severity::Debug => tracing::debug!("{}", entry),
            Severity::Info => tracing::info!("{}", entry),
            Severity::Warning => tracing::warn!("{}", entry),
            Severity::Error | Severity::Fatal => tracing::error!("{}", entry),
        }
        match severity {
            Severity::Warning => self.nwarnings += 1,
            Severity::Error | Severity::Fatal => self.nerrors += 1,
            _ => {}
        }
        self.entries.push(entry);
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.report(Severity::Debug, message);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.report(Severity::Info, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.report(Severity::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.report(Severity::Error, message);
    }

    pub fn fatal(&mut self, message: impl Into<String>) {
        self.report(Severity::Fatal, message);
    }

    pub fn num_errors(&self) -> usize {
        self.nerrors
    }

    pub fn num_warnings(&self) -> usize {
        self.nwarnings
    }

    /// True when no error- or fatal-severity message has been reported.
    pub fn ok(&self) -> bool {
        self.nerrors == 0
    }

    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }
}

/// Marker for a failed element `configure`/`initialize` hook. The detail
/// lives in the [`ErrorSink`] the hook reported into.
#[derive(Debug, Error)]
#[error("element hook failed")]
pub struct ElementFailed;

/// Outcome of an element lifecycle hook.
pub type ElementResult = Result<(), ElementFailed>;

/// Errors from master-level operations.
#[derive(Debug, Error)]
pub enum MasterError {
    /// The router still has scheduled tasks or timers; tear it down first.
    #[error("router is still in use ({0} tasks or timers scheduled)")]
    RouterInUse(usize),

    /// The router is not registered with this master.
    #[error("router is not registered with this master")]
    NotRegistered,
}

/// Errors detected while building or activating an element graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate element name `{0}`")]
    DuplicateName(String),

    #[error("unknown element id")]
    UnknownElement,

    #[error("{element}: port {port} out of range")]
    PortOutOfRange { element: String, port: usize },

    #[error("incompatible port kinds: `{from}` [{from_port}] -> [{to_port}] `{to}`")]
    KindMismatch {
        from: String,
        from_port: usize,
        to: String,
        to_port: usize,
    },

    #[error("`{element}` [{port}]: {kind} port connected more than once")]
    DuplicateConnection {
        element: String,
        port: usize,
        kind: &'static str,
    },

    #[error("{nerrors} configuration or initialization errors")]
    InitFailed { nerrors: usize },
}
