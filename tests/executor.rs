use weft::{ContextLocal, Error, ErrorKind, Executor, Inline, PromiseValue, ThreadPoolBuilder};

use proptest::prelude::*;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

static TENANT: ContextLocal<String> = ContextLocal::new("tenant");

const WAIT: Duration = Duration::from_secs(5);

fn pool(name: &str) -> Executor {
    ThreadPoolBuilder::new()
        .name(name)
        .worker_threads(2)
        .build()
        .unwrap()
}

fn thread_name() -> String {
    thread::current().name().unwrap_or_default().to_string()
}

#[test]
fn test_exec_runs_on_pool_thread() {
    let pool = pool("exec-pool");

    let name = pool.exec(async { Ok(thread_name()) }).block(WAIT).unwrap();

    assert!(name.starts_with("exec-pool-"), "Unexpected thread {name}");
}

#[test]
fn test_current_identifies_executor() {
    let pool = pool("exec-current");
    assert_eq!(Executor::current(), None);

    let inside = pool.exec(async { Ok(Executor::current()) }).block(WAIT).unwrap();

    assert_eq!(inside.as_ref(), Some(&pool));
    assert_eq!(inside.map(|e| e.id()), Some(pool.id()));
}

#[test]
fn test_exec_propagates_failure() {
    let pool = pool("exec-fail");

    let outcome = pool
        .exec(async { Err::<u32, _>(Error::msg("broken")) })
        .block(WAIT);

    assert_eq!(outcome, Err(Error::msg("broken")));
}

#[test]
fn test_exec_panic_becomes_rejection() {
    let pool = pool("exec-panic");

    let outcome = pool
        .exec(async {
            if thread_name().starts_with("exec-panic") {
                panic!("task exploded");
            }
            Ok(0u32)
        })
        .block(WAIT);

    let error = outcome.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Panicked);

    let survivor = pool.exec(async { Ok(1u32) }).block(WAIT);
    assert_eq!(survivor, Ok(1), "Pool must keep running after a panic");
}

#[test]
fn test_exec_blocking_runs_closure() {
    let pool = pool("exec-blocking");

    let value = pool
        .exec_blocking(|| {
            thread::sleep(Duration::from_millis(10));
            Ok((thread_name(), TENANT.get()))
        })
        .block(WAIT)
        .unwrap();

    assert!(value.0.starts_with("exec-blocking-"));
    assert_eq!(value.1, None);
}

#[test]
fn test_exec_blocking_sees_caller_locals() {
    let pool = pool("exec-blocking-ctx");

    let seen = TENANT
        .exec("acme".to_string(), || pool.exec_blocking(|| Ok(TENANT.get())))
        .unwrap();

    assert_eq!(seen.block(WAIT).unwrap().as_deref(), Some("acme"));
}

#[test]
fn test_many_tasks_all_complete() {
    let pool = pool("exec-many");
    let counter = Arc::new(Mutex::new(0));

    let promises: Vec<_> = (0..100)
        .map(|i| {
            let counter = counter.clone();
            pool.exec(async move {
                *counter.lock().unwrap() += 1;
                Ok(i)
            })
        })
        .collect();

    let values = weft::all(promises).block(WAIT).unwrap();
    assert_eq!(values, (0..100).collect::<Vec<_>>());
    assert_eq!(*counter.lock().unwrap(), 100);
}

#[test]
fn test_await_resumes_on_owning_executor() {
    let pool = pool("exec-await");
    let (gate, open) = PromiseValue::<()>::pending();

    let promise = pool.exec(async move {
        gate.await?;
        Ok(thread_name())
    });

    // Settled from a foreign thread; the continuation still runs on the pool.
    thread::spawn(move || open.resolve(())).join().unwrap();

    assert!(promise.block(WAIT).unwrap().starts_with("exec-await-"));
}

#[test]
fn test_relay_settles_on_origin_executor() {
    let origin = pool("relay-origin");
    let remote = pool("relay-remote");
    let observed = Arc::new(Mutex::new(None));

    let record = observed.clone();
    let task = TENANT
        .exec("acme".to_string(), || {
            origin.exec(async move {
                let relayed = Executor::relay(|| {
                    remote.exec_blocking(|| {
                        thread::sleep(Duration::from_millis(20));
                        Ok(thread_name())
                    })
                });

                let after_call = Executor::current();

                relayed.on_complete(move |_| {
                    *record.lock().unwrap() =
                        Some((thread_name(), Executor::current().map(|e| e.name().to_string()), TENANT.get()));
                });

                let worker = relayed.await?;
                Ok((worker, after_call, Executor::current()))
            })
        })
        .unwrap();

    let (worker, after_call, after_await) = task.block(WAIT).unwrap();
    assert!(worker.starts_with("relay-remote-"), "Supplied work ran on {worker}");
    assert_eq!(after_call.as_ref(), Some(&origin), "Still on the origin right after relay");
    assert_eq!(after_await.as_ref(), Some(&origin), "Back on the origin after awaiting");

    let (thread, executor, tenant) = observed.lock().unwrap().clone().unwrap();
    assert!(thread.starts_with("relay-origin-"), "Continuation ran on {thread}");
    assert_eq!(executor.as_deref(), Some("relay-origin"));
    assert_eq!(tenant.as_deref(), Some("acme"));
}

#[test]
fn test_relay_outside_executor_returns_supplier_value() {
    let relayed = Executor::relay(|| PromiseValue::result(3));

    assert_eq!(relayed.peek(), Some(Ok(3)));
}

#[test]
fn test_inline_executor_runs_synchronously() {
    let inline = Executor::new("inline", Inline);

    let promise = inline.exec(async { Ok(Executor::current().map(|e| e.name().to_string())) });

    assert_eq!(promise.peek(), Some(Ok(Some("inline".to_string()))));
}

#[test]
fn test_executor_shutdown_abandons_new_work() {
    let pool = pool("exec-shutdown");
    pool.shutdown();

    let error = pool.exec(async { Ok(1u32) }).block(WAIT).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Abandoned);

    let error = pool.exec_blocking(|| Ok(1u32)).block(WAIT).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Abandoned);
}

type Landing = Arc<Mutex<Vec<(usize, Option<String>)>>>;

/// Each level relays into the next level's pool; the relayed value must settle
/// back on the pool of the level that issued the relay.
fn relay_chain(pools: Arc<Vec<Executor>>, level: usize, landings: Landing) -> PromiseValue<usize> {
    let executor = pools[level].clone();
    executor.exec(async move {
        if level + 1 == pools.len() {
            return Ok(level);
        }

        let next = {
            let (pools, landings) = (pools.clone(), landings.clone());
            Executor::relay(move || relay_chain(pools, level + 1, landings))
        };

        let record = landings.clone();
        next.on_complete(move |_| {
            let name = Executor::current().map(|e| e.name().to_string());
            record.lock().unwrap().push((level, name));
        });

        next.await
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn test_nested_relays_resume_at_each_call_site(depth in 2usize..6) {
        let pools: Arc<Vec<Executor>> = Arc::new((0..depth).map(|i| pool(&format!("relay-{i}"))).collect());
        let landings: Landing = Arc::new(Mutex::new(Vec::new()));

        let deepest = relay_chain(pools.clone(), 0, landings.clone()).block(WAIT).unwrap();
        prop_assert_eq!(deepest, depth - 1);

        let mut landings = landings.lock().unwrap().clone();
        landings.sort();
        prop_assert_eq!(landings.len(), depth - 1);
        for (level, name) in landings {
            prop_assert_eq!(name, Some(format!("relay-{level}")));
        }
    }
}
