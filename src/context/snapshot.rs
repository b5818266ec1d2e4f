//! Immutable captures of the active context locals.

use crate::context::frame::{FrameStack, Value};
use crate::context::local::{AnyLocal, ContextLocal};
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::context::{self, Execution};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct SnapshotEntry {
    pub(crate) local: &'static dyn AnyLocal,
    /// Most recent first.
    pub(crate) values: Vec<Value>,
}

/// Every active context local's value(s) at the moment of capture.
///
/// Taken whenever work is handed to a scheduler and restored verbatim when
/// that work runs. Cloning is a reference count bump.
#[derive(Clone, Default)]
pub struct Snapshot {
    entries: Arc<[SnapshotEntry]>,
}

impl Snapshot {
    pub(crate) fn from_entries(entries: Vec<SnapshotEntry>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    pub(crate) fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    /// Captures the locals active on the calling logical execution.
    pub fn capture() -> Self {
        context::with_frames(|frames| frames.snapshot())
    }

    fn entry<T: 'static>(&self, local: &'static ContextLocal<T>) -> Option<&SnapshotEntry> {
        let id = local.id();
        self.entries.iter().find(|e| e.local.id() == id)
    }

    /// Top value captured for `local`.
    pub fn get<T>(&self, local: &'static ContextLocal<T>) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entry(local)
            .and_then(|e| e.values.first())
            .and_then(|v| v.downcast_ref::<T>().cloned())
    }

    /// Full captured stack for `local`, most recent first.
    pub fn stack<T>(&self, local: &'static ContextLocal<T>) -> Vec<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entry(local)
            .map(|e| {
                e.values
                    .iter()
                    .filter_map(|v| v.downcast_ref::<T>().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains<T: 'static>(&self, local: &'static ContextLocal<T>) -> bool {
        self.entry(local).is_some()
    }

    /// Names of the captured locals in activation order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.local.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs `body` with this snapshot as the active set of locals, then puts
    /// the previous set back.
    pub fn enter<R>(&self, body: impl FnOnce() -> R) -> R {
        let mut execution = Execution::new(FrameStack::restore(self), context::current_trace());
        let executor = context::current_executor();
        context::enter_context(executor.as_ref(), &mut execution, body)
    }

    /// Wire form of every captured local that declares a codec, keyed by
    /// local name. Only the top value of a stacking local is carried.
    pub fn encode(&self) -> Result<BTreeMap<String, String>> {
        let mut wire = BTreeMap::new();
        for entry in self.entries.iter() {
            let Some(top) = entry.values.first() else {
                continue;
            };
            if let Some(encoded) = entry.local.encode_value(top) {
                wire.insert(entry.local.name().to_string(), encoded?);
            }
        }
        Ok(wire)
    }

    /// Rebuilds a snapshot from [`Snapshot::encode`] output.
    ///
    /// Names in `wire` without a matching local in `locals` are ignored.
    pub fn decode(
        wire: &BTreeMap<String, String>,
        locals: &[&'static dyn AnyLocal],
    ) -> Result<Snapshot> {
        let mut entries = Vec::new();
        for local in locals {
            let Some(text) = wire.get(local.name()) else {
                continue;
            };
            let value = local.decode_value(text).ok_or_else(|| {
                Error::new(ErrorKind::Codec)
                    .with_message(format!("context local `{}` has no codec", local.name()))
            })??;
            entries.push(SnapshotEntry {
                local: *local,
                values: vec![value],
            });
        }
        Ok(Snapshot::from_entries(entries))
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|e| (e.local.name(), e.values.len())))
            .finish()
    }
}
