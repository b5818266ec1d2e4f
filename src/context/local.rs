//! Context-scoped variables.
//!
//! A [`ContextLocal`] is declared once, usually as a `static`, and carries no
//! value itself. Values live in the [`FrameStack`] of the logical execution
//! that activated them and travel with it across every scheduling hop.
//!
//! ```ignore
//! use weft::ContextLocal;
//!
//! static TENANT: ContextLocal<String> = ContextLocal::new("tenant");
//!
//! TENANT.exec("acme".to_string(), || {
//!     assert_eq!(TENANT.get().as_deref(), Some("acme"));
//! })?;
//! ```
//!
//! [`FrameStack`]: crate::context::frame::FrameStack

use crate::context::codec::Codec;
use crate::context::frame::Value;
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::context;

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a declared local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(u64);

/// Object-safe view of a [`ContextLocal`] used by snapshots and codecs.
pub trait AnyLocal: Send + Sync + 'static {
    fn id(&self) -> LocalId;

    fn name(&self) -> &'static str;

    fn is_stacking(&self) -> bool;

    /// `None` when the local declares no codec.
    #[doc(hidden)]
    fn encode_value(&self, value: &Value) -> Option<Result<String>>;

    /// `None` when the local declares no codec.
    #[doc(hidden)]
    fn decode_value(&self, wire: &str) -> Option<Result<Value>>;
}

/// A variable scoped to the logical execution rather than the thread.
///
/// Exclusive locals (the default) refuse a second, different value while one
/// is active; re-activating the same value is a no-op. Stacking locals always
/// push and pop.
pub struct ContextLocal<T: 'static> {
    name: &'static str,
    stacking: bool,
    id: AtomicU64,
    codec: Option<Codec<T>>,
}

impl<T: 'static> ContextLocal<T> {
    /// Declares an exclusive local.
    pub const fn new(name: &'static str) -> Self {
        Self::declare(name, false, None)
    }

    /// Declares a stacking local.
    pub const fn stacking(name: &'static str) -> Self {
        Self::declare(name, true, None)
    }

    /// Declares a local whose values can cross a process boundary via `codec`.
    pub const fn encoded(name: &'static str, stacking: bool, codec: Codec<T>) -> Self {
        Self::declare(name, stacking, Some(codec))
    }

    const fn declare(name: &'static str, stacking: bool, codec: Option<Codec<T>>) -> Self {
        Self {
            name,
            stacking,
            id: AtomicU64::new(0),
            codec,
        }
    }

    pub(crate) fn id(&self) -> LocalId {
        let id = self.id.load(Ordering::Acquire);
        if id != 0 {
            return LocalId(id);
        }

        let fresh = NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed);
        match self
            .id
            .compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => LocalId(fresh),
            Err(existing) => LocalId(existing),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_stacking(&self) -> bool {
        self.stacking
    }
}

impl<T> ContextLocal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// The active value, or `None` outside every activation.
    pub fn get(&'static self) -> Option<T> {
        let id = self.id();
        context::with_frames(|frames| frames.top(id).and_then(|v| v.downcast_ref::<T>().cloned()))
    }

    /// Every active value, most recent first. Exclusive locals hold at most one.
    pub fn stack(&'static self) -> Vec<T> {
        let id = self.id();
        context::with_frames(|frames| {
            frames
                .stack(id)
                .filter_map(|v| v.downcast_ref::<T>().cloned())
                .collect()
        })
    }

    /// Runs `body` with `value` active, deactivating on every exit path.
    ///
    /// Fails with [`ErrorKind::ExclusivityViolation`] before running `body`
    /// when an exclusive local already holds a different value.
    pub fn exec<R>(&'static self, value: T, body: impl FnOnce() -> R) -> Result<R> {
        let _activation = self.activate(value)?;
        Ok(body())
    }

    /// Async form of [`exec`](Self::exec): `value` is active around every poll
    /// of `future`.
    pub fn scope<F: Future>(&'static self, value: T, future: F) -> Scoped<T, F> {
        Scoped {
            local: self,
            value,
            future: Box::pin(future),
        }
    }

    /// Starts a composite activation; see [`Bindings`].
    pub fn with(&'static self, value: T) -> Bindings {
        Bindings::new().with(self, value)
    }

    pub(crate) fn activate(&'static self, value: T) -> Result<Activation> {
        let id = self.id();
        context::with_frames(|frames| {
            if !self.stacking
                && let Some(active) = frames.top(id)
            {
                return match active.downcast_ref::<T>() {
                    Some(current) if *current == value => Ok(Activation::reentrant()),
                    _ => {
                        tracing::debug!(local = self.name, "refusing conflicting activation");
                        Err(Error::new(ErrorKind::ExclusivityViolation).with_message(format!(
                            "`{}` is already bound to a different value",
                            self.name
                        )))
                    }
                };
            }

            frames.push(self, Arc::new(value));
            Ok(Activation::pushed(id))
        })
    }

    /// Encodes the active value with the declared codec.
    pub fn encode_current(&'static self) -> Result<Option<String>> {
        let codec = self.codec_or_err()?;
        self.get().map(|v| (codec.encode)(&v)).transpose()
    }

    /// Decodes a wire value with the declared codec.
    pub fn decode(&self, wire: &str) -> Result<T> {
        (self.codec_or_err()?.decode)(wire)
    }

    fn codec_or_err(&self) -> Result<Codec<T>> {
        self.codec.ok_or_else(|| {
            Error::new(ErrorKind::Codec)
                .with_message(format!("context local `{}` has no codec", self.name))
        })
    }
}

impl<T> AnyLocal for ContextLocal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn id(&self) -> LocalId {
        ContextLocal::id(self)
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn is_stacking(&self) -> bool {
        self.stacking
    }

    fn encode_value(&self, value: &Value) -> Option<Result<String>> {
        let codec = self.codec?;
        Some(match value.downcast_ref::<T>() {
            Some(v) => (codec.encode)(v),
            None => Err(Error::new(ErrorKind::Codec).with_message("value type mismatch")),
        })
    }

    fn decode_value(&self, wire: &str) -> Option<Result<Value>> {
        let codec = self.codec?;
        Some((codec.decode)(wire).map(|v| Arc::new(v) as Value))
    }
}

/// Undoes one activation when dropped. Tied to the thread that created it.
pub(crate) struct Activation {
    pushed: Option<LocalId>,
    _not_send: PhantomData<*const ()>,
}

impl Activation {
    fn pushed(id: LocalId) -> Self {
        Self {
            pushed: Some(id),
            _not_send: PhantomData,
        }
    }

    fn reentrant() -> Self {
        Self {
            pushed: None,
            _not_send: PhantomData,
        }
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        if let Some(id) = self.pushed {
            context::with_frames(|frames| frames.pop(id));
        }
    }
}

// Drops activations most recent first.
struct Unwind(Vec<Activation>);

impl Drop for Unwind {
    fn drop(&mut self) {
        while let Some(activation) = self.0.pop() {
            drop(activation);
        }
    }
}

type Binder = Box<dyn FnOnce() -> Result<Activation>>;

/// Several activations applied as one, in declaration order, unwound in
/// reverse.
///
/// ```ignore
/// TENANT.with("acme".into()).with(&REQUEST, 7).exec(|| handle())?;
/// ```
#[must_use]
pub struct Bindings {
    binders: Vec<Binder>,
}

impl Bindings {
    fn new() -> Self {
        Self {
            binders: Vec::new(),
        }
    }

    pub fn with<T>(mut self, local: &'static ContextLocal<T>, value: T) -> Self
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.binders.push(Box::new(move || local.activate(value)));
        self
    }

    /// Applies every binding, runs `body`, then unwinds.
    ///
    /// If any binding conflicts, the ones already applied are unwound and
    /// `body` does not run.
    pub fn exec<R>(self, body: impl FnOnce() -> R) -> Result<R> {
        let mut unwind = Unwind(Vec::with_capacity(self.binders.len()));
        for bind in self.binders {
            unwind.0.push(bind()?);
        }
        Ok(body())
    }
}

/// Future returned by [`ContextLocal::scope`].
pub struct Scoped<T: 'static, F> {
    local: &'static ContextLocal<T>,
    value: T,
    future: Pin<Box<F>>,
}

impl<T, F> Future for Scoped<T, F>
where
    T: Clone + PartialEq + Send + Sync + Unpin + 'static,
    F: Future,
{
    type Output = Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _activation = match this.local.activate(this.value.clone()) {
            Ok(activation) => activation,
            Err(e) => return Poll::Ready(Err(e)),
        };
        this.future.as_mut().poll(cx).map(Ok)
    }
}
