//! Causality traces: a linked record of the scheduling hops a logical
//! execution went through.
//!
//! Every `exec`, `exec_blocking`, `relay`, `yield_now` and suspending `.await`
//! links a new [`Hop`] under the trace active at the call site. Nodes are immutable and shared, so
//! a trace costs one small allocation per hop and is never copied.
//!
//! When a failure reaches a reporting boundary the trace attached to the error
//! is turned into a real error chain with [`Trace::materialize`], one layer per
//! hop, most recent hop outermost.

use crate::runtime::context;

use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// What kind of scheduling boundary a hop crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HopKind {
    Exec,
    ExecBlocking,
    Relay,
    Yield,
    /// A task suspended awaiting a value that had not settled yet.
    Await,
    /// A deferred serial queue entry starting behind earlier entries for its key.
    Serial,
}

impl HopKind {
    /// Hops recorded on the running execution itself rather than on a fork.
    /// A loop repeats them, so they fold.
    fn folds(self) -> bool {
        matches!(self, HopKind::Relay | HopKind::Yield | HopKind::Await)
    }
}

impl fmt::Display for HopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HopKind::Exec => "exec",
            HopKind::ExecBlocking => "exec_blocking",
            HopKind::Relay => "relay",
            HopKind::Yield => "yield",
            HopKind::Await => "await",
            HopKind::Serial => "serial",
        })
    }
}

/// One scheduling boundary crossing.
#[derive(Debug, Clone)]
pub struct Hop {
    kind: HopKind,
    location: &'static Location<'static>,
    executor: Option<Arc<str>>,
}

impl Hop {
    pub(crate) fn new(
        kind: HopKind,
        location: &'static Location<'static>,
        executor: Option<Arc<str>>,
    ) -> Self {
        Self {
            kind,
            location,
            executor,
        }
    }

    pub fn kind(&self) -> HopKind {
        self.kind
    }

    /// Source location of the call that crossed the boundary.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Name of the executor the hop targeted, if any.
    pub fn executor(&self) -> Option<&str> {
        self.executor.as_deref()
    }

    fn same_site(&self, other: &Hop) -> bool {
        self.kind == other.kind
            && std::ptr::eq(self.location, other.location)
            && self.executor == other.executor
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(name) = &self.executor {
            write!(f, " on `{name}`")?;
        }
        write!(f, " ({})", self.location)
    }
}

struct Node {
    hop: Hop,
    parent: Option<Trace>,
}

/// Immutable, most-recent-first chain of hops.
#[derive(Clone)]
pub struct Trace(Arc<Node>);

impl Trace {
    /// Links `hop` under `parent`.
    pub(crate) fn child(parent: Option<Trace>, hop: Hop) -> Self {
        Trace(Arc::new(Node { hop, parent }))
    }

    /// Links `hop` under `parent`.
    ///
    /// A relay, yield or await whose call site already appears in the run of
    /// such hops directly above rewinds the trace to that site, so a loop
    /// keeps one hop per distinct site however often it iterates.
    pub(crate) fn advance(parent: Option<Trace>, hop: Hop) -> Self {
        if hop.kind.folds() {
            let mut cursor = parent.as_ref();
            while let Some(trace) = cursor {
                if !trace.hop().kind.folds() {
                    break;
                }
                if trace.hop().same_site(&hop) {
                    return Trace::child(trace.parent().cloned(), hop);
                }
                cursor = trace.parent();
            }
        }
        Trace::child(parent, hop)
    }

    /// The trace of the logical execution running on this thread, if any.
    pub fn current() -> Option<Trace> {
        context::current_trace()
    }

    /// Most recent hop.
    pub fn hop(&self) -> &Hop {
        &self.0.hop
    }

    pub fn parent(&self) -> Option<&Trace> {
        self.0.parent.as_ref()
    }

    /// Number of hops in the chain.
    pub fn depth(&self) -> usize {
        self.hops().count()
    }

    /// Iterates hops from the most recent back to the first.
    pub fn hops(&self) -> impl Iterator<Item = &Hop> {
        std::iter::successors(Some(self), |t| t.parent()).map(Trace::hop)
    }

    /// Builds the chained error mirroring this trace.
    pub fn materialize(&self) -> HopError {
        let older: Vec<&Hop> = self.hops().skip(1).collect();

        let mut cause: Option<Box<HopError>> = None;
        for hop in older.into_iter().rev() {
            cause = Some(Box::new(HopError {
                hop: hop.clone(),
                cause,
            }));
        }

        HopError {
            hop: self.hop().clone(),
            cause,
        }
    }

    /// Whether `self` extends `other` (or is `other`).
    pub fn descends_from(&self, other: &Trace) -> bool {
        std::iter::successors(Some(self), |t| t.parent()).any(|t| Arc::ptr_eq(&t.0, &other.0))
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.hops()).finish()
    }
}

/// One layer of a materialized trace. `source()` yields the previous hop.
#[derive(Debug, Clone)]
pub struct HopError {
    hop: Hop,
    cause: Option<Box<HopError>>,
}

impl HopError {
    pub fn hop(&self) -> &Hop {
        &self.hop
    }
}

impl fmt::Display for HopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scheduled via {}", self.hop)
    }
}

impl std::error::Error for HopError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|e| e as _)
    }
}
