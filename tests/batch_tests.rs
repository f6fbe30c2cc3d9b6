//! These tests are intended to ensure that a batch fetch is called the
//! correct number of times, with the correct keys, for different
//! configurations

use cooked_waker::{IntoWaker, Wake, WakeRef};
use crossbeam;
use futures::{executor, future, FutureExt};
use futures_timer::Delay;
use rowloader::{Key, LoadError, Loader, LoaderOptions};
use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    sync::Mutex,
    task::{Context, Poll},
    thread,
    time::Duration,
};

type Row = (i64, String);

async fn echo(keys: Vec<Key>) -> Result<Vec<Row>, &'static str> {
    Ok(keys
        .iter()
        .filter_map(Key::as_id)
        .map(|id| (id, id.to_string()))
        .collect())
}

fn owner(row: &Row) -> Option<Key> {
    Some(Key::Id(row.0))
}

fn call_counter<'a, T, R>(
    counter: &'a AtomicUsize,
    function: impl Clone + Fn(T) -> R + 'a,
) -> impl Clone + Fn(T) -> R + 'a {
    move |argument| {
        counter.fetch_add(1, Ordering::SeqCst);
        function(argument)
    }
}

#[test]
fn simple_coalesce() {
    let counter = AtomicUsize::new(0);

    let loader = Loader::new(
        call_counter(&counter, echo),
        owner,
        LoaderOptions::default(),
    );

    let fut1 = loader.load(10);
    let fut2 = loader.load(20);

    let res1 = executor::block_on(fut1).unwrap();
    let res2 = executor::block_on(fut2).unwrap();

    assert_eq!(res1[0].1, "10");
    assert_eq!(res2[0].1, "20");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn duplicate_keys_share_one_slot() {
    let counter = AtomicUsize::new(0);

    let loader = Loader::new(
        call_counter(&counter, echo),
        owner,
        LoaderOptions::default(),
    );

    // All three normalize to the same key, so the batch holds one slot and
    // every caller gets a handle to the same group.
    let fut1 = loader.load(42);
    let fut2 = loader.load("42");
    let fut3 = loader.load(" 42 ");

    let res1 = executor::block_on(fut1).unwrap();
    let res2 = executor::block_on(fut2).unwrap();
    let res3 = executor::block_on(fut3).unwrap();

    assert!(std::sync::Arc::ptr_eq(&res1, &res2));
    assert_eq!(res3[0].1, "42");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn batch_size_limit_splits_batches() {
    let counter = AtomicUsize::new(0);
    let calls: Mutex<Vec<Vec<Key>>> = Mutex::new(Vec::new());

    let fetch = |keys: Vec<Key>| {
        calls.lock().unwrap().push(keys.clone());
        echo(keys)
    };

    let loader = Loader::new(
        call_counter(&counter, fetch),
        owner,
        LoaderOptions {
            max_batch_size: NonZeroUsize::new(2),
            ..LoaderOptions::default()
        },
    );

    let fut1 = loader.load(10);
    let fut2 = loader.load(20);
    let fut3 = loader.load(30);

    let res1 = executor::block_on(fut1).unwrap();
    let res2 = executor::block_on(fut2).unwrap();
    let res3 = executor::block_on(fut3).unwrap();

    assert_eq!(res1[0].1, "10");
    assert_eq!(res2[0].1, "20");
    assert_eq!(res3[0].1, "30");
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    let calls = calls.lock().unwrap();
    assert_eq!(calls[0], vec![Key::Id(10), Key::Id(20)]);
    assert_eq!(calls[1], vec![Key::Id(30)]);
}

#[test]
fn groups_align_with_keys_not_with_row_order() {
    let counter = AtomicUsize::new(0);

    // Rows come back unordered and unevenly distributed; key 20 owns
    // nothing at all.
    let fetch = |_keys: Vec<Key>| async {
        Ok::<Vec<Row>, &'static str>(vec![
            (30, "c".to_owned()),
            (10, "a".to_owned()),
            (10, "b".to_owned()),
        ])
    };

    let loader = Loader::new(
        call_counter(&counter, fetch),
        owner,
        LoaderOptions::default(),
    );

    let groups = executor::block_on(loader.load_many(vec![10i64, 20, 30]));

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(groups.len(), 3);

    let first = groups[0].as_ref().unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].1, "a");
    assert_eq!(first[1].1, "b");

    assert!(groups[1].as_ref().unwrap().is_empty());
    assert_eq!(groups[2].as_ref().unwrap()[0].1, "c");
}

#[test]
fn failed_batch_rejects_every_waiter() {
    let counter = AtomicUsize::new(0);

    let fetch = |_keys: Vec<Key>| future::ready(Err::<Vec<Row>, _>("db down"));

    let loader = Loader::new(
        call_counter(&counter, fetch),
        owner,
        LoaderOptions::default(),
    );

    let fut1 = loader.load(1);
    let fut2 = loader.load(2);
    let fut3 = loader.load(3);

    for fut in vec![fut1, fut2, fut3] {
        match executor::block_on(fut) {
            Err(LoadError::Fetch(cause)) => assert_eq!(cause, "db down"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // Failures are memoized like successes: a retry requires an evict.
    let again = executor::block_on(loader.load(1));
    assert!(again.is_err());
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    assert!(loader.evict(1));
    let _ = executor::block_on(loader.load(1));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

/// Spawn several load futures in different threads over a timer window, and
/// confirm that a single batch fetch fulfilled all of them
#[test]
fn test_threaded() {
    let counter = AtomicUsize::new(0);

    let loader = Loader::with_window(
        call_counter(&counter, echo),
        owner,
        || Delay::new(Duration::from_millis(10)),
        LoaderOptions::default(),
    );
    let loader_ref = &loader;

    let result: Vec<String> = crossbeam::scope(move |s| {
        let threads: Vec<_> = (0..4)
            .map(move |i| {
                s.spawn(move |_s| {
                    thread::sleep(Duration::from_millis(i + 2));
                    let fut = loader_ref.load(i as i64);
                    let result = executor::block_on(fut);
                    result.unwrap()[0].1.clone()
                })
            })
            .collect();

        let result: Vec<String> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        result
    })
    .unwrap();

    assert_eq!(result, &["0", "1", "2", "3"]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone)]
struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

#[test]
fn test_key_limit_instant_trigger() {
    let loader = Loader::with_window(
        echo,
        owner,
        || future::pending(),
        LoaderOptions {
            max_batch_size: NonZeroUsize::new(3),
            ..LoaderOptions::default()
        },
    );

    let waker = std::sync::Arc::new(NoOpWaker);
    let waker = waker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1);
    assert!(fut1.poll_unpin(&mut ctx).is_pending());

    let mut fut2 = loader.load(2);
    assert!(fut2.poll_unpin(&mut ctx).is_pending());

    // Reusing a key means we won't yet be at the key limit
    let mut fut11 = loader.load(1);
    assert!(fut11.poll_unpin(&mut ctx).is_pending());

    let mut fut3 = loader.load(3);

    match fut3.poll_unpin(&mut ctx) {
        Poll::Ready(Ok(group)) => assert_eq!(group[0].1, "3"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    match fut1.poll_unpin(&mut ctx) {
        Poll::Ready(Ok(group)) => assert_eq!(group[0].1, "1"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    match fut11.poll_unpin(&mut ctx) {
        Poll::Ready(Ok(group)) => assert_eq!(group[0].1, "1"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    match fut2.poll_unpin(&mut ctx) {
        Poll::Ready(Ok(group)) => assert_eq!(group[0].1, "2"),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

/// A waker that flips a flag, so a test can observe a handoff wake.
#[derive(Debug, Clone, Default)]
struct FlagWaker(std::sync::Arc<AtomicBool>);

impl FlagWaker {
    fn woken(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl WakeRef for FlagWaker {
    fn wake_by_ref(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Wake for FlagWaker {}

#[test]
fn dropping_the_driving_future_wakes_another_waiter() {
    let loader = Loader::with_window(
        echo,
        owner,
        || future::pending(),
        LoaderOptions::default(),
    );

    let flag = FlagWaker::default();
    let flag_waker = std::sync::Arc::new(flag.clone()).into_waker();
    let mut flag_ctx = Context::from_waker(&flag_waker);

    let noop_waker = std::sync::Arc::new(NoOpWaker).into_waker();
    let mut noop_ctx = Context::from_waker(&noop_waker);

    let mut fut1 = loader.load(1);
    assert!(fut1.poll_unpin(&mut flag_ctx).is_pending());

    // fut2 polled last, so its task is the one driving the window.
    let mut fut2 = loader.load(2);
    assert!(fut2.poll_unpin(&mut noop_ctx).is_pending());
    assert!(!flag.woken());

    // Dropping the driver must wake fut1's task so the batch keeps moving.
    drop(fut2);
    assert!(flag.woken());
}
