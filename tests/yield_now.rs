use weft::{ContextLocal, Executor, HopKind, ThreadPerTask, ThreadPoolBuilder, Trace, yield_now};

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

static TENANT: ContextLocal<String> = ContextLocal::new("tenant");

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_yield_outside_executor_is_settled() {
    let checkpoint = yield_now();

    assert!(checkpoint.is_settled());
    assert_eq!(futures::executor::block_on(checkpoint), Ok(()));
}

#[test]
fn test_yield_resumes_on_different_thread() {
    let fresh = Executor::new("fresh", ThreadPerTask::new("fresh"));

    let (before, after, executor) = fresh
        .exec(async {
            let before = thread::current().id();
            yield_now().await?;
            let after = thread::current().id();
            Ok((before, after, Executor::current().map(|e| e.name().to_string())))
        })
        .block(WAIT)
        .unwrap();

    assert_ne!(before, after, "Continuation must resume via the pool");
    assert_eq!(executor.as_deref(), Some("fresh"));
}

#[test]
fn test_yield_keeps_context_locals() {
    let fresh = Executor::new("fresh-ctx", ThreadPerTask::new("fresh-ctx"));

    let seen = TENANT
        .exec("acme".to_string(), || {
            fresh.exec(async {
                yield_now().await?;
                Ok(TENANT.get())
            })
        })
        .unwrap();

    assert_eq!(seen.block(WAIT).unwrap().as_deref(), Some("acme"));
}

#[test]
fn test_yield_lets_queued_work_run() {
    let pool = ThreadPoolBuilder::new()
        .name("yield-fifo")
        .worker_threads(1)
        .build()
        .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    // Hold the only worker until both tasks are queued.
    let (release, gate) = std::sync::mpsc::channel::<()>();
    let held = pool.exec_blocking(move || {
        gate.recv().ok();
        Ok(())
    });

    let first_log = log.clone();
    let first = pool.exec(async move {
        first_log.lock().unwrap().push("first:start");
        yield_now().await?;
        first_log.lock().unwrap().push("first:end");
        Ok(())
    });

    let second_log = log.clone();
    let second = pool.exec(async move {
        second_log.lock().unwrap().push("second");
        Ok(())
    });

    release.send(()).unwrap();
    weft::all(vec![held, first, second]).block(WAIT).unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["first:start", "second", "first:end"]);
}

#[test]
fn test_yield_records_hop() {
    let fresh = Executor::new("fresh-trace", ThreadPerTask::new("fresh-trace"));

    let trace = fresh
        .exec(async {
            for _ in 0..10 {
                yield_now().await?;
            }
            Ok(Trace::current())
        })
        .block(WAIT)
        .unwrap()
        .unwrap();

    let kinds: Vec<HopKind> = trace.hops().map(|h| h.kind()).collect();
    assert_eq!(kinds, vec![HopKind::Yield, HopKind::Exec], "Yields at one site fold together");
}
