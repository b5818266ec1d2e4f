use crate::promise::PromiseValue;
use crate::runtime::context;
use crate::runtime::executor::Executor;
use crate::runtime::scheduler::Hint;
use crate::trace::{Hop, HopKind};

use std::panic::Location;

/// Cooperative checkpoint: lets other work queued on the current executor run.
///
/// Schedules a trivial unit behind everything already queued on the current
/// executor; the returned value settles when that unit runs. Awaiting it
/// always suspends once, so the rest of the task is re-queued on the same
/// executor and resumes from its pool. Outside any executor the value is
/// already settled.
///
/// ```ignore
/// for chunk in rows.chunks(256) {
///     index(chunk);
///     yield_now().await?;
/// }
/// ```
#[track_caller]
pub fn yield_now() -> PromiseValue<()> {
    checkpoint(Executor::current().as_ref(), Location::caller(), true)
}

/// Yields on `executor`. With `record`, the hop is linked onto the running
/// execution's trace, which is only correct when called from that execution.
pub(crate) fn checkpoint(
    executor: Option<&Executor>,
    location: &'static Location<'static>,
    record: bool,
) -> PromiseValue<()> {
    let Some(executor) = executor else {
        return PromiseValue::result(());
    };

    if record {
        context::advance_trace(Hop::new(
            HopKind::Yield,
            location,
            Some(executor.name().into()),
        ));
    }

    let (promise, resolver) = PromiseValue::pending();
    let unit = move || {
        resolver.resolve(());
    };
    if let Err(e) = executor.submit(Hint::NonBlocking, Box::new(unit)) {
        tracing::warn!(executor = %executor.name(), error = %e, "yield could not be scheduled");
    }

    promise.into_checkpoint()
}
