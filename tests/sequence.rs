use weft::{
    AsyncSequence, Error, ErrorKind, Executor, IterSequence, PromiseValue, RuntimeConfig,
    ThreadPoolBuilder, collect_all,
};

use futures::StreamExt;
use proptest::prelude::*;

use std::num::NonZeroUsize;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn pool(name: &str) -> Executor {
    ThreadPoolBuilder::new()
        .name(name)
        .worker_threads(2)
        .build()
        .unwrap()
}

fn every(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

/// Counts down from `remaining`, then fails.
struct Failing {
    remaining: usize,
}

impl AsyncSequence for Failing {
    type Item = usize;

    fn next(&mut self) -> PromiseValue<usize> {
        match self.remaining {
            0 => PromiseValue::rejected(Error::msg("source broke")),
            n => {
                self.remaining -= 1;
                PromiseValue::result(n)
            }
        }
    }
}

/// Produces every element from another thread.
struct Delayed {
    next: u32,
    end: u32,
}

impl AsyncSequence for Delayed {
    type Item = u32;

    fn next(&mut self) -> PromiseValue<u32> {
        if self.next == self.end {
            return PromiseValue::rejected(Error::new(ErrorKind::NoMoreElements));
        }
        let value = self.next;
        self.next += 1;

        let (promise, resolver) = PromiseValue::pending();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1));
            resolver.resolve(value);
        });
        promise
    }
}

fn drain_counting<S: AsyncSequence + 'static>(
    executor: &Executor,
    sequence: weft::Yielding<S>,
) -> (Vec<S::Item>, usize) {
    executor
        .exec(async move {
            let mut sequence = sequence;
            let mut items = Vec::new();
            loop {
                match sequence.next().await {
                    Ok(item) => items.push(item),
                    Err(e) if e.is_end_of_sequence() => break,
                    Err(e) => return Err(e),
                }
            }
            Ok((items, sequence.checkpoints()))
        })
        .block(WAIT)
        .unwrap()
}

#[test]
fn test_iter_sequence_ends_with_no_more_elements() {
    let mut sequence = IterSequence::new(vec![1, 2]);

    assert_eq!(sequence.next().peek(), Some(Ok(1)));
    assert_eq!(sequence.next().peek(), Some(Ok(2)));

    let end = sequence.next().peek().unwrap().unwrap_err();
    assert_eq!(end.kind(), ErrorKind::NoMoreElements);
    assert!(end.is_end_of_sequence());
}

#[test]
fn test_collect_all() {
    let items = futures::executor::block_on(collect_all(IterSequence::new(0..5)));

    assert_eq!(items, Ok(vec![0, 1, 2, 3, 4]));
}

#[test]
fn test_collect_all_stops_on_failure() {
    let outcome = futures::executor::block_on(collect_all(Failing { remaining: 2 }));

    assert_eq!(outcome, Err(Error::msg("source broke")));
}

#[test]
fn test_into_stream() {
    let items: Vec<_> = futures::executor::block_on(IterSequence::new(["a", "b"]).into_stream().collect());
    assert_eq!(items, vec![Ok("a"), Ok("b")]);

    let items: Vec<_> = futures::executor::block_on(Failing { remaining: 1 }.into_stream().collect());
    assert_eq!(items, vec![Ok(1), Err(Error::msg("source broke"))]);
}

#[test]
fn test_yielding_keeps_every_element_in_order() {
    let pool = pool("seq-order");

    let (items, checkpoints) = drain_counting(&pool, IterSequence::new(0..10).yielding(every(3)));

    assert_eq!(items, (0..10).collect::<Vec<_>>());
    assert_eq!(checkpoints, 3);
}

#[test]
fn test_yielding_over_asynchronous_source() {
    let pool = pool("seq-async");

    let (items, checkpoints) = drain_counting(&pool, Delayed { next: 0, end: 7 }.yielding(every(2)));

    assert_eq!(items, (0..7).collect::<Vec<_>>());
    assert_eq!(checkpoints, 3);
}

#[test]
fn test_yielding_does_not_delay_failures() {
    let mut sequence = Failing { remaining: 1 }.yielding(every(1));

    assert_eq!(sequence.next().peek(), Some(Ok(1)));
    let failure = sequence.next();
    assert_eq!(failure.peek(), Some(Err(Error::msg("source broke"))));
    assert_eq!(sequence.checkpoints(), 0);
}

#[test]
fn test_yielding_outside_executor() {
    let sequence = IterSequence::new(0..4).yielding(every(1));

    let items = futures::executor::block_on(collect_all(sequence));
    assert_eq!(items, Ok(vec![0, 1, 2, 3]));
}

#[test]
fn test_yielding_from_config_cadence() {
    let pool = pool("seq-config");
    let config = RuntimeConfig {
        yield_every: 4,
        ..RuntimeConfig::default()
    };

    let (items, checkpoints) = drain_counting(&pool, IterSequence::new(0..13).yielding_from(&config));

    assert_eq!(items, (0..13).collect::<Vec<_>>());
    assert_eq!(checkpoints, 3);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_checkpoint_count(k in 0usize..120, n in 1usize..8) {
        let pool = pool("seq-prop");

        let (items, checkpoints) = drain_counting(&pool, IterSequence::new(0..k).yielding(every(n)));

        prop_assert_eq!(items.len(), k);
        prop_assert_eq!(checkpoints, k.saturating_sub(1) / n);
    }
}
