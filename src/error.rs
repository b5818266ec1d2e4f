//! Error type shared by every primitive in the crate.
//!
//! An [`Error`] is a small value: a kind, an optional message, an optional
//! shared source, and an optional causality [`Trace`]. The trace is a
//! diagnostic attachment only. Equality and `Display` ignore it, so code that
//! handles a rejection sees the error exactly as it was produced. Reporting
//! boundaries call [`Error::report`] to render every recorded scheduling hop.

use crate::trace::Trace;

use std::fmt;
use std::sync::Arc;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    /// A promise settled with an error produced by user code.
    #[error("value rejected")]
    Rejected,

    /// A non-stacking context local was activated with a second, different value.
    #[error("exclusive context local already bound to a different value")]
    ExclusivityViolation,

    /// A serial queue entry waited longer than its lock timeout.
    #[error("timed out waiting for serial key lock")]
    LockTimeout,

    /// A blocking wait on a promise exceeded its deadline.
    #[error("timed out blocking on promise")]
    BlockTimeout,

    /// An async sequence is exhausted.
    #[error("no more elements")]
    NoMoreElements,

    /// A body or mapping step panicked.
    #[error("panicked")]
    Panicked,

    /// A resolver was dropped before settling its promise.
    #[error("promise abandoned before settling")]
    Abandoned,

    /// The wrapped scheduler refused new work.
    #[error("scheduler shut down")]
    Shutdown,

    /// A context local encode/decode hook failed.
    #[error("context codec failure")]
    Codec,

    /// A worker or timer thread could not be started.
    #[error("failed to start thread")]
    Spawn,

    /// Runtime or logging configuration could not be loaded.
    #[error("invalid configuration")]
    Config,
}

/// The crate error.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    trace: Option<Trace>,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
            trace: None,
        }
    }

    /// Wraps an arbitrary error as a rejection.
    pub fn rejected(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::Rejected).with_source(source)
    }

    /// A rejection described only by a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Downcasts the wrapped source, if any, to a concrete error type.
    pub fn source_as<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }

    /// The causality trace recorded where this error first crossed a hop.
    pub fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }

    /// Attaches `trace` unless one is already present.
    ///
    /// The first attachment wins: it is the deepest point of the failure.
    pub(crate) fn traced(mut self, trace: Option<Trace>) -> Self {
        if self.trace.is_none() {
            self.trace = trace;
        }
        self
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::LockTimeout | ErrorKind::BlockTimeout)
    }

    /// Sequence exhaustion is a control signal, not a failure.
    pub fn is_end_of_sequence(&self) -> bool {
        self.kind == ErrorKind::NoMoreElements
    }

    /// Renders the error followed by every scheduling hop that led to it.
    pub fn report(&self) -> Report<'_> {
        Report(self)
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };

        Self::new(ErrorKind::Panicked).with_message(detail)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.message == other.message
            && match (&self.source, &other.source) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a.to_string() == b.to_string(),
                (None, None) => true,
                _ => false,
            }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Error");
        s.field("kind", &self.kind);
        if let Some(message) = &self.message {
            s.field("message", message);
        }
        if let Some(source) = &self.source {
            s.field("source", &format_args!("{source}"));
        }
        if let Some(trace) = &self.trace {
            s.field("hops", &trace.depth());
        }
        s.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.source) {
            (Some(msg), _) => write!(f, "{}: {msg}", self.kind),
            (None, Some(source)) => write!(f, "{}: {source}", self.kind),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Display adapter returned by [`Error::report`].
pub struct Report<'a>(&'a Error);

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        if let Some(trace) = &self.0.trace {
            for hop in trace.hops() {
                write!(f, "\n    at {hop}")?;
            }
        }
        Ok(())
    }
}
