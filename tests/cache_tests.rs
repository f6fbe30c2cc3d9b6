//! These tests cover the memoization contract: resolved keys never re-enter
//! the batch path until they are explicitly evicted

use futures::executor;
use rowloader::{Key, KeyError, LoadError, Loader, LoaderOptions};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

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
fn resolved_keys_come_from_cache() {
    let counter = AtomicUsize::new(0);

    let loader = Loader::new(
        call_counter(&counter, echo),
        owner,
        LoaderOptions::default(),
    );

    let first = executor::block_on(loader.load(7)).unwrap();
    let second = executor::block_on(loader.load(7)).unwrap();

    // Same allocation both times: the cache hands out the memoized group.
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // Normalized forms hit the same entry.
    let third = executor::block_on(loader.load("7")).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &third));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn evict_forces_a_fresh_fetch() {
    let counter = AtomicUsize::new(0);
    let payload = Mutex::new("before");

    let fetch = |keys: Vec<Key>| {
        let tag = *payload.lock().unwrap();
        async move {
            Ok::<Vec<Row>, &'static str>(
                keys.iter()
                    .filter_map(Key::as_id)
                    .map(|id| (id, tag.to_owned()))
                    .collect(),
            )
        }
    };

    let loader = Loader::new(
        call_counter(&counter, fetch),
        owner,
        LoaderOptions::default(),
    );

    let first = executor::block_on(loader.load(1)).unwrap();
    assert_eq!(first[0].1, "before");

    // The write/evict/re-load cycle the mutation layer performs.
    *payload.lock().unwrap() = "after";
    assert!(loader.evict(1));
    assert!(!loader.evict(1));

    let second = executor::block_on(loader.load(1)).unwrap();
    assert_eq!(second[0].1, "after");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn clear_cache_drops_everything() {
    let counter = AtomicUsize::new(0);

    let loader = Loader::new(
        call_counter(&counter, echo),
        owner,
        LoaderOptions::default(),
    );

    executor::block_on(loader.load(1)).unwrap();
    executor::block_on(loader.load(2)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    loader.clear_cache();

    executor::block_on(loader.load(1)).unwrap();
    executor::block_on(loader.load(2)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[test]
fn primed_keys_skip_the_batch_path() {
    let counter = AtomicUsize::new(0);

    let loader = Loader::new(
        call_counter(&counter, echo),
        owner,
        LoaderOptions::default(),
    );

    loader.prime(5, vec![(5, "primed".to_owned())]).unwrap();

    let group = executor::block_on(loader.load(5)).unwrap();
    assert_eq!(group[0].1, "primed");
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    // Priming never clobbers an existing entry.
    loader.prime(5, vec![(5, "clobber".to_owned())]).unwrap();
    let group = executor::block_on(loader.load(5)).unwrap();
    assert_eq!(group[0].1, "primed");
}

#[test]
fn caching_can_be_disabled() {
    let counter = AtomicUsize::new(0);

    let loader = Loader::new(
        call_counter(&counter, echo),
        owner,
        LoaderOptions {
            cache: false,
            ..LoaderOptions::default()
        },
    );

    executor::block_on(loader.load(1)).unwrap();
    executor::block_on(loader.load(1)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn invalid_keys_reject_only_their_own_call() {
    let counter = AtomicUsize::new(0);

    let loader = Loader::new(
        call_counter(&counter, echo),
        owner,
        LoaderOptions::default(),
    );

    let bad = loader.load(Value::Null);
    let good = loader.load(1);

    match executor::block_on(bad) {
        Err(LoadError::Key(KeyError::Null)) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }

    let group = executor::block_on(good).unwrap();
    assert_eq!(group[0].1, "1");
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // Nothing was cached under a sentinel for the bad key.
    assert!(!loader.evict(Value::Null));
}
