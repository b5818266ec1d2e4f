use weft::{
    ContextLocal, Error, ErrorKind, Executor, PromiseValue, RuntimeConfig, SerialQueue,
    ThreadPoolBuilder,
};

use proptest::prelude::*;

use std::sync::{Arc, Mutex};
use std::time::Duration;

static TENANT: ContextLocal<String> = ContextLocal::new("tenant");

const WAIT: Duration = Duration::from_secs(10);
const LONG: Duration = Duration::from_secs(30);

fn pool(name: &str) -> Executor {
    ThreadPoolBuilder::new()
        .name(name)
        .worker_threads(4)
        .build()
        .unwrap()
}

fn run_marked(queue: &SerialQueue<&'static str>, count: usize) -> Vec<(usize, &'static str)> {
    let log = Arc::new(Mutex::new(Vec::new()));

    let promises: Vec<_> = (0..count)
        .map(|i| {
            let log = log.clone();
            queue.exec("account", LONG, move || async move {
                log.lock().unwrap().push((i, "start"));
                weft::sleep(Duration::from_millis(1)).await?;
                log.lock().unwrap().push((i, "end"));
                Ok(i)
            })
        })
        .collect();

    weft::all(promises).block(WAIT).unwrap();
    let log = log.lock().unwrap().clone();
    log
}

#[test]
fn test_same_key_runs_one_at_a_time_in_order() {
    let queue = SerialQueue::new(pool("serial-order"));

    let log = run_marked(&queue, 10);

    let expected: Vec<_> = (0..10).flat_map(|i| [(i, "start"), (i, "end")]).collect();
    assert_eq!(log, expected);
}

#[test]
fn test_different_keys_do_not_wait_on_each_other() {
    let queue = SerialQueue::new(pool("serial-keys"));
    let (signal, resolver) = PromiseValue::<()>::pending();
    let resolver = Arc::new(Mutex::new(Some(resolver)));

    // "a" waits for "b"; serializing across keys would deadlock.
    let waiting = queue.exec("a", LONG, move || async move { signal.await });
    let releasing = queue.exec("b", LONG, move || async move {
        if let Some(resolver) = resolver.lock().unwrap().take() {
            resolver.resolve(());
        }
        Ok(())
    });

    assert_eq!(releasing.block(WAIT), Ok(()));
    assert_eq!(waiting.block(WAIT), Ok(()));
}

#[test]
fn test_lock_timeout_rejects_without_running_body() {
    let queue = SerialQueue::new(pool("serial-timeout"));
    let (hold, release) = PromiseValue::<()>::pending();
    let ran = Arc::new(Mutex::new(false));

    let holder = queue.exec("k", LONG, move || async move { hold.await });

    let flag = ran.clone();
    let starved = queue.exec("k", Duration::from_millis(50), move || async move {
        *flag.lock().unwrap() = true;
        Ok(())
    });

    let error = starved.block(WAIT).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::LockTimeout);
    assert_eq!(queue.waiting(&"k"), 0, "Timed-out entry must leave the backlog");

    release.resolve(());
    assert_eq!(holder.block(WAIT), Ok(()));
    assert!(!*ran.lock().unwrap(), "A timed-out body must never run");

    let later = queue.exec("k", LONG, || async { Ok(5) });
    assert_eq!(later.block(WAIT), Ok(5));
}

#[test]
fn test_failure_does_not_block_later_entries() {
    let queue = SerialQueue::new(pool("serial-failure"));

    let failed = queue.exec(1u32, LONG, || async { Err::<u32, _>(Error::msg("first failed")) });
    let panicked = queue.exec(1u32, LONG, || async {
        if std::thread::current().name().is_some() {
            panic!("second panicked");
        }
        Ok(0)
    });
    let next = queue.exec(1u32, LONG, || async { Ok(3) });

    assert_eq!(failed.block(WAIT), Err(Error::msg("first failed")));
    assert_eq!(panicked.block(WAIT).unwrap_err().kind(), ErrorKind::Panicked);
    assert_eq!(next.block(WAIT), Ok(3));
}

#[test]
fn test_quiet_keys_are_forgotten() {
    let queue = SerialQueue::new(pool("serial-cleanup"));

    let promises: Vec<_> = (0..50u32)
        .map(|i| queue.exec(i % 5, LONG, move || async move { Ok(i) }))
        .collect();
    weft::all(promises).block(WAIT).unwrap();

    assert_eq!(queue.active_keys(), 0);
}

#[test]
fn test_preserving_restores_locals_for_body_and_observers() {
    let queue = SerialQueue::new(pool("serial-preserve"));
    let (hold, release) = PromiseValue::<()>::pending();
    let observed = Arc::new(Mutex::new(None));

    let holder = queue.exec("k", LONG, move || async move { hold.await });

    let (preserved, plain) = TENANT
        .exec("acme".to_string(), || {
            let preserved = queue.exec_preserving("k", LONG, || async { Ok(TENANT.get()) });
            let plain = queue.exec("k", LONG, || async { Ok(TENANT.get()) });
            (preserved, plain)
        })
        .unwrap();

    let record = observed.clone();
    preserved.on_complete(move |_| *record.lock().unwrap() = Some(TENANT.get()));

    release.resolve(());
    holder.block(WAIT).unwrap();

    assert_eq!(preserved.block(WAIT).unwrap().as_deref(), Some("acme"));
    assert_eq!(plain.block(WAIT).unwrap(), None, "Deferred plain entries start with no locals");
    assert_eq!(
        observed.lock().unwrap().clone(),
        Some(Some("acme".to_string())),
        "Observers run under the submitter's locals"
    );
}

#[test]
fn test_immediate_entry_sees_caller_locals() {
    let queue = SerialQueue::new(pool("serial-immediate"));

    let seen = TENANT
        .exec("acme".to_string(), || queue.exec("fresh", LONG, || async { Ok(TENANT.get()) }))
        .unwrap();

    assert_eq!(seen.block(WAIT).unwrap().as_deref(), Some("acme"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn test_markers_stay_adjacent(count in 1usize..24) {
        let queue = SerialQueue::new(pool("serial-prop"));

        let log = run_marked(&queue, count);

        prop_assert_eq!(log.len(), count * 2);
        for (i, pair) in log.chunks(2).enumerate() {
            prop_assert_eq!(pair, &[(i, "start"), (i, "end")][..]);
        }
        prop_assert_eq!(queue.active_keys(), 0);
    }
}

#[test]
fn test_unbounded_lock_timeout_waits_for_key() {
    let queue = SerialQueue::new(pool("serial-unbounded"));
    let (hold, release) = PromiseValue::<()>::pending();

    let holder = queue.exec("k", LONG, move || async move { hold.await });
    let waiter = queue.exec("k", Duration::MAX, || async { Ok("ran") });
    assert_eq!(queue.waiting(&"k"), 1);

    release.resolve(());
    assert_eq!(holder.block(WAIT), Ok(()));
    assert_eq!(waiter.block(WAIT), Ok("ran"));
}

#[test]
fn test_run_uses_configured_lock_timeout() {
    let config = RuntimeConfig {
        lock_timeout_ms: 50,
        ..RuntimeConfig::default()
    };
    let queue = SerialQueue::from_config(pool("serial-configured"), &config);
    assert_eq!(queue.lock_timeout(), Duration::from_millis(50));

    let (hold, release) = PromiseValue::<()>::pending();
    let holder = queue.run("k", move || async move { hold.await });
    let starved = queue.run("k", || async { Ok(()) });

    let error = starved.block(WAIT).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::LockTimeout);

    release.resolve(());
    assert_eq!(holder.block(WAIT), Ok(()));
}

#[test]
fn test_default_queue_uses_default_lock_timeout() {
    let queue = SerialQueue::<u32>::new(pool("serial-default"));

    assert_eq!(queue.lock_timeout(), RuntimeConfig::default().lock_timeout());
    assert_eq!(queue.run(1, || async { Ok(2) }).block(WAIT), Ok(2));
}

#[test]
fn test_started_entries_release_their_timers() {
    let queue = SerialQueue::new(pool("serial-timers"));
    let (hold, release) = PromiseValue::<()>::pending();

    let holder = queue.exec(0u32, LONG, move || async move { hold.await });
    let waiters: Vec<_> = (0..200u32)
        .map(|i| queue.exec(0u32, Duration::from_secs(3600), move || async move { Ok(i) }))
        .collect();
    let armed = weft::pending_timers();

    release.resolve(());
    holder.block(WAIT).unwrap();
    assert_eq!(weft::all(waiters).block(WAIT).unwrap(), (0..200).collect::<Vec<_>>());

    // Cancelled deadlines are compacted instead of lingering for an hour.
    assert!(
        weft::pending_timers() + 100 < armed,
        "{} timers still pending out of {armed}",
        weft::pending_timers()
    );
}
