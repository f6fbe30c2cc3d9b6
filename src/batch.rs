//! The batch coalescer.
//!
//! A [`Loader`] collects the point lookups issued during one scheduling tick
//! into a single pending batch, fires exactly one batch fetch for it when
//! the dispatch window closes (or earlier, when the batch reaches its size
//! limit), groups the flat result rows back into per-key groups, memoizes
//! every key's outcome, and hands each caller its own group through the
//! future created at `load` time.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
};

use tracing::{debug, error, warn};

use crate::cache::{KeyCache, Outcome, SharedKeyCache};
use crate::error::LoadError;
use crate::group::{group_rows, Group};
use crate::key::{IntoKey, Key, KeyList};
use crate::wakerset::{WakerSet, WakerToken};

/// Default batch size limit, matching the largest `in (...)` list the
/// downstream store is expected to take in one round trip.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 250;

/// A batch fetch function: ordered unique keys in, flat rows out.
///
/// The keys are guaranteed non-empty, unique, and no more than the loader's
/// batch size limit. Every returned row must be attributable to one of the
/// keys through the loader's [`RowKey`]; row order is up to the
/// implementation and key order must not be assumed in the result.
///
/// Implemented for free by any `Fn(Vec<Key>) -> Future` closure or async fn.
pub trait Fetcher<R, E> {
    type Fut: Future<Output = Result<Vec<R>, E>>;

    fn fetch(&self, keys: Vec<Key>) -> Self::Fut;
}

impl<R, E, F, Fut> Fetcher<R, E> for F
where
    F: Fn(Vec<Key>) -> Fut,
    Fut: Future<Output = Result<Vec<R>, E>>,
{
    type Fut = Fut;

    fn fetch(&self, keys: Vec<Key>) -> Fut {
        self(keys)
    }
}

/// Extracts the owning key from one fetched row — typically by reading the
/// foreign-key column the batch query tagged the row with.
///
/// Returning `None` marks the row as unattributable, which fails the whole
/// batch with a grouping fault. Implemented for free by any
/// `Fn(&R) -> Option<Key>` closure.
pub trait RowKey<R> {
    fn owner(&self, row: &R) -> Option<Key>;
}

impl<R, F> RowKey<R> for F
where
    F: Fn(&R) -> Option<Key>,
{
    fn owner(&self, row: &R) -> Option<Key> {
        self(row)
    }
}

/// Per-loader configuration.
#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    /// Name used in logs.
    pub name: &'static str,

    /// Seal and dispatch a pending batch as soon as it holds this many
    /// unique keys, instead of waiting for the dispatch window. `None`
    /// leaves batches bounded only by the window; a limit of 1 disables
    /// coalescing entirely.
    pub max_batch_size: Option<NonZeroUsize>,

    /// Memoize per-key outcomes for the lifetime of the loader.
    pub cache: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            name: "loader",
            max_batch_size: NonZeroUsize::new(DEFAULT_MAX_BATCH_SIZE),
            cache: true,
        }
    }
}

/// A dispatch window that closes at the end of the current scheduling tick.
///
/// It returns `Pending` exactly once, re-waking itself immediately, and
/// completes on the next poll. Deferring the batch fetch by that single
/// yield gives every resolver queued in the current tick the chance to add
/// its key before the fetch fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NextTick {
    elapsed: bool,
}

impl Future for NextTick {
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.elapsed {
            Poll::Ready(())
        } else {
            this.elapsed = true;
            ctx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Factory for [`NextTick`], the default dispatch window.
pub fn next_tick() -> NextTick {
    NextTick::default()
}

/// State every batch shares with its owning loader: how rows map back to
/// keys, and where resolved outcomes are memoized.
struct LoaderShared<R, E, K> {
    name: &'static str,
    key_of: K,
    cache: CacheHandle<R, LoadError<E>>,
}

enum CacheHandle<R, E> {
    /// Caching disabled for this loader.
    Off,
    /// Request-scoped cache owned by the loader.
    Request(Mutex<KeyCache<R, E>>),
    /// Explicitly opted-in process-wide reference cache.
    Process(Arc<SharedKeyCache<R, E>>),
}

impl<R, E: Clone> CacheHandle<R, E> {
    fn get(&self, key: &Key) -> Option<Outcome<R, E>> {
        match self {
            CacheHandle::Off => None,
            CacheHandle::Request(cache) => cache.lock().unwrap().get(key),
            CacheHandle::Process(cache) => cache.get(key),
        }
    }

    fn set(&self, key: Key, outcome: Outcome<R, E>) {
        match self {
            CacheHandle::Off => {}
            CacheHandle::Request(cache) => cache.lock().unwrap().set(key, outcome),
            CacheHandle::Process(cache) => cache.set(key, outcome),
        }
    }

    fn evict(&self, key: &Key) -> bool {
        match self {
            CacheHandle::Off => false,
            CacheHandle::Request(cache) => cache.lock().unwrap().evict(key),
            CacheHandle::Process(cache) => cache.evict(key),
        }
    }

    fn clear(&self) {
        match self {
            CacheHandle::Off => {}
            CacheHandle::Request(cache) => cache.lock().unwrap().clear(),
            CacheHandle::Process(cache) => cache.clear(),
        }
    }
}

/// A batch that is still collecting keys.
struct GatherState<R, E, F, K, D> {
    keys: KeyList,
    fetch: F,
    window: Option<D>,
    wakers: WakerSet,
    shared: Arc<LoaderShared<R, E, K>>,
}

/// A sealed batch whose fetch is in flight.
struct FetchState<R, E, K, Fut> {
    keys: Vec<Key>,
    fut: Fut,
    wakers: WakerSet,
    shared: Arc<LoaderShared<R, E, K>>,
}

enum State<R, E, F, K, D>
where
    F: Fetcher<R, E>,
{
    Gathering(GatherState<R, E, F, K, D>),
    Fetching(FetchState<R, E, K, F::Fut>),
    Settled(Result<HashMap<Key, Group<R>>, LoadError<E>>),
}

impl<R, E, F, K, D> Debug for State<R, E, F, K, D>
where
    F: Fetcher<R, E>,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            State::Gathering(gather) => f
                .debug_struct("Gathering")
                .field("keys", &gather.keys)
                .finish(),
            State::Fetching(fetching) => f
                .debug_struct("Fetching")
                .field("keys", &fetching.keys)
                .finish(),
            State::Settled(..) => f.debug_struct("Settled").finish(),
        }
    }
}

/// A batched, deduplicating, per-key caching loader — one per entity or
/// relation type.
///
/// `load` calls issued while a batch is gathering all land in that batch;
/// the batch fetch fires once per (tick, loader) pair, or earlier when the
/// batch size limit is reached. Loaders are cheap to create and are meant
/// to be request-scoped: one loader per entity type per incoming request,
/// discarded with the request. They must not be shared across unrelated
/// requests, except through the explicit process-wide reference cache of
/// [`Loader::with_shared_cache`].
pub struct Loader<R, E, F, K, W, D>
where
    F: Fetcher<R, E>,
{
    fetch: F,
    window: W,
    options: LoaderOptions,
    shared: Arc<LoaderShared<R, E, K>>,
    pending: Mutex<Weak<Mutex<State<R, E, F, K, D>>>>,
}

impl<R, E, F, K> Loader<R, E, F, K, fn() -> NextTick, NextTick>
where
    F: Fetcher<R, E> + Clone,
    K: RowKey<R>,
    E: Clone,
{
    /// Build a loader that dispatches at the end of the current scheduling
    /// tick (see [`NextTick`]).
    pub fn new(fetch: F, key_of: K, options: LoaderOptions) -> Self {
        Self::with_window(fetch, key_of, next_tick as fn() -> NextTick, options)
    }

    /// Build a tick-dispatched loader whose outcomes are memoized in a
    /// process-wide cache instead of a per-request one.
    ///
    /// This is the explicit opt-in for near-static reference tables; the
    /// cache outlives any one loader and must be invalidated manually when
    /// the reference data changes. The `cache` field of `options` is
    /// ignored.
    pub fn with_shared_cache(
        fetch: F,
        key_of: K,
        cache: Arc<SharedKeyCache<R, LoadError<E>>>,
        options: LoaderOptions,
    ) -> Self {
        Self {
            fetch,
            window: next_tick as fn() -> NextTick,
            options,
            shared: Arc::new(LoaderShared {
                name: options.name,
                key_of,
                cache: CacheHandle::Process(cache),
            }),
            pending: Mutex::new(Weak::new()),
        }
    }
}

impl<R, E, F, K, W, D> Loader<R, E, F, K, W, D>
where
    F: Fetcher<R, E> + Clone,
    K: RowKey<R>,
    E: Clone,
    W: Fn() -> D,
    D: Future<Output = ()>,
{
    /// Build a loader with a custom dispatch window — for example a short
    /// timer, to coalesce keys across ticks.
    pub fn with_window(fetch: F, key_of: K, window: W, options: LoaderOptions) -> Self {
        let cache = if options.cache {
            CacheHandle::Request(Mutex::new(KeyCache::new()))
        } else {
            CacheHandle::Off
        };

        Self {
            fetch,
            window,
            options,
            shared: Arc::new(LoaderShared {
                name: options.name,
                key_of,
                cache,
            }),
            pending: Mutex::new(Weak::new()),
        }
    }

    /// Request the row group for one key.
    ///
    /// A key that fails normalization resolves this future (and only this
    /// future) with the normalization error. A key with a memoized outcome
    /// resolves from cache without touching the batch path. Otherwise the
    /// key joins the currently gathering batch — opening one if none is
    /// open — and the future resolves when that batch's fetch completes. A
    /// key already present in the gathering batch is not added again; all
    /// of its callers share one downstream slot.
    pub fn load(&self, key: impl IntoKey) -> LoadFuture<R, E, F, K, D> {
        let key = match key.into_key() {
            Ok(key) => key,
            Err(err) => return LoadFuture::settled(Err(LoadError::Key(err))),
        };

        if let Some(outcome) = self.shared.cache.get(&key) {
            return LoadFuture::settled(outcome);
        }

        let mut pending = self.pending.lock().unwrap();

        // If a batch is still gathering, join it. Timing is never checked
        // here: once the window has elapsed, the next poll will move the
        // state to Fetching, and until that happens new keys may ride along.
        if let Some(state_handle) = pending.upgrade() {
            // A poisoned state means a fetch poll panicked; fall through and
            // start fresh rather than propagating here. The guard is scoped
            // so it is released before the future is handed out.
            let joined = match state_handle.lock() {
                Ok(mut state_guard) => match *state_guard {
                    State::Gathering(ref mut gather) => {
                        gather.keys.insert(&key);

                        let sealed = matches!(
                            self.options.max_batch_size,
                            Some(max) if gather.keys.len() >= max.get()
                        );
                        if sealed {
                            // Sealed early: cancel the window and kick the
                            // driver so the fetch fires now.
                            gather.window = None;
                            gather.wakers.wake_driver();
                        }
                        Some(sealed)
                    }
                    _ => None,
                },
                Err(..) => None,
            };

            if let Some(sealed) = joined {
                if sealed {
                    // Detach the sealed batch so further keys open a fresh
                    // one.
                    *pending = Weak::new();
                }
                return LoadFuture::waiting(key, state_handle);
            }
        }

        let mut keys = KeyList::new();
        keys.insert(&key);

        // A limit of one key per batch means no coalescing at all; skip the
        // window so the first poll dispatches immediately.
        let coalesce = match self.options.max_batch_size {
            Some(max) => max.get() > 1,
            None => true,
        };

        let state = Arc::new(Mutex::new(State::Gathering(GatherState {
            keys,
            fetch: self.fetch.clone(),
            window: if coalesce { Some((self.window)()) } else { None },
            wakers: WakerSet::default(),
            shared: Arc::clone(&self.shared),
        })));

        if coalesce {
            *pending = Arc::downgrade(&state);
        }

        LoadFuture::waiting(key, state)
    }

    /// Request row groups for many keys at once, preserving input order.
    ///
    /// Sugar over [`load`]: all keys land in the same gathering batch
    /// (subject to the size limit), and the output holds one per-key result
    /// per input key, aligned with the input.
    ///
    /// [`load`]: Loader::load
    pub fn load_many<I>(&self, keys: I) -> LoadMany<R, E, F, K, D>
    where
        I: IntoIterator,
        I::Item: IntoKey,
    {
        LoadMany {
            slots: keys
                .into_iter()
                .map(|key| ManySlot::Pending(self.load(key)))
                .collect(),
        }
    }

    /// Drop the memoized outcome for a key, so the next `load` re-enters
    /// the batch path. This is the hook for the mutation layer: write,
    /// evict, re-load. Returns whether an entry was evicted.
    pub fn evict(&self, key: impl IntoKey) -> bool {
        match key.into_key() {
            Ok(key) => self.shared.cache.evict(&key),
            Err(..) => false,
        }
    }

    /// Drop every memoized outcome.
    pub fn clear_cache(&self) {
        self.shared.cache.clear();
    }

    /// Seed the cache with a known row group for a key. An entry already
    /// present is kept; evict first to replace it.
    pub fn prime(&self, key: impl IntoKey, rows: Vec<R>) -> Result<(), crate::error::KeyError> {
        let key = key.into_key()?;
        self.shared.cache.set(key, Ok(Group::from(rows)));
        Ok(())
    }

    /// This loader's configuration.
    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }
}

/// Group the fetch result, memoize every key's outcome, and produce the
/// settled per-key map shared by all waiters of the batch.
fn settle<R, E, K>(
    shared: &LoaderShared<R, E, K>,
    keys: &[Key],
    result: Result<Vec<R>, E>,
) -> Result<HashMap<Key, Group<R>>, LoadError<E>>
where
    K: RowKey<R>,
    E: Clone,
{
    let outcome = match result {
        Ok(rows) => match group_rows(keys, rows, |row| shared.key_of.owner(row)) {
            Ok(groups) => Ok(keys.iter().cloned().zip(groups).collect::<HashMap<_, _>>()),
            Err(fault) => {
                error!(
                    loader = shared.name,
                    index = fault.index,
                    "batch result row carries no recognizable owner key"
                );
                Err(LoadError::Grouping(fault))
            }
        },
        Err(err) => {
            warn!(loader = shared.name, "batch fetch failed");
            Err(LoadError::Fetch(err))
        }
    };

    // Memoize per-key outcomes — failures included — so later loads never
    // re-enter the batch path without an explicit evict.
    match &outcome {
        Ok(groups) => {
            for (key, group) in groups {
                shared.cache.set(key.clone(), Ok(Arc::clone(group)));
            }
        }
        Err(err) => {
            for key in keys {
                shared.cache.set(key.clone(), Err(err.clone()));
            }
        }
    }

    outcome
}

/// The pending result of one `load` call: resolves to the row group for its
/// key once the owning batch completes (or immediately, on a cache hit or a
/// key error).
pub struct LoadFuture<R, E, F, K, D>
where
    F: Fetcher<R, E>,
{
    inner: FutureInner<R, E, F, K, D>,
}

enum FutureInner<R, E, F, K, D>
where
    F: Fetcher<R, E>,
{
    /// Resolved at `load` time: cache hit or key error.
    Ready(Option<Result<Group<R>, LoadError<E>>>),
    /// Waiting on a shared batch.
    Waiting {
        key: Key,
        token: Option<WakerToken>,
        state: Option<Arc<Mutex<State<R, E, F, K, D>>>>,
    },
}

impl<R, E, F, K, D> LoadFuture<R, E, F, K, D>
where
    F: Fetcher<R, E>,
{
    fn settled(outcome: Result<Group<R>, LoadError<E>>) -> Self {
        Self {
            inner: FutureInner::Ready(Some(outcome)),
        }
    }

    fn waiting(key: Key, state: Arc<Mutex<State<R, E, F, K, D>>>) -> Self {
        Self {
            inner: FutureInner::Waiting {
                key,
                token: None,
                state: Some(state),
            },
        }
    }
}

impl<R, E, F, K, D> Future for LoadFuture<R, E, F, K, D>
where
    F: Fetcher<R, E>,
    K: RowKey<R>,
    E: Clone + Unpin,
    D: Future<Output = ()>,
{
    type Output = Result<Group<R>, LoadError<E>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        let (key, token, state) = match &mut unpinned.inner {
            FutureInner::Ready(outcome) => {
                return Poll::Ready(outcome.take().expect("polled a completed LoadFuture"));
            }
            FutureInner::Waiting { key, token, state } => (key, token, state),
        };

        // Note about this mutex: it is safe to hold in an async context
        // because the guard never lives across a poll boundary. Poisoning
        // propagates a panic from whichever poll drove the batch.
        let mut guard = state
            .as_ref()
            .expect("polled a completed LoadFuture")
            .lock()
            .unwrap();

        if let State::Gathering(ref mut gather) = *guard {
            if let Some(ref mut window) = gather.window {
                // Safety: the window lives inside the shared state behind an
                // Arc and is never moved; it is destructed in place when the
                // state transitions below.
                let pinned = unsafe { Pin::new_unchecked(window) };
                if pinned.poll(ctx).is_pending() {
                    // This task now drives the window.
                    match token {
                        Some(token) => gather.wakers.refresh(token, ctx.waker()),
                        None => *token = Some(gather.wakers.register(ctx.waker().clone())),
                    }
                    return Poll::Pending;
                }
            }

            // Window elapsed (or was never armed): seal the batch and start
            // the fetch.
            let wakers = mem::take(&mut gather.wakers);
            let keys = gather.keys.take();
            let shared = Arc::clone(&gather.shared);
            debug!(
                loader = shared.name,
                keys = keys.len(),
                "dispatching batch fetch"
            );

            // The fetch future has not been pinned yet and is free to move
            // into the new state.
            let fut = gather.fetch.fetch(keys.clone());

            // The window is destructed in place here, upholding its pin.
            *guard = State::Fetching(FetchState {
                keys,
                fut,
                wakers,
                shared,
            });
        }

        if let State::Fetching(ref mut fetching) = *guard {
            // Safety: the fetch future is never moved out of the shared
            // state; it is destructed in place on the transition below.
            let fut = unsafe { Pin::new_unchecked(&mut fetching.fut) };
            let result = match fut.poll(ctx) {
                Poll::Pending => {
                    // This task now drives the fetch.
                    match token {
                        Some(token) => fetching.wakers.refresh(token, ctx.waker()),
                        None => *token = Some(fetching.wakers.register(ctx.waker().clone())),
                    }
                    return Poll::Pending;
                }
                Poll::Ready(result) => result,
            };

            let outcome = settle(&fetching.shared, &fetching.keys, result);

            // Wake every other waiter; this future takes its own result
            // directly below.
            let wakers = mem::take(&mut fetching.wakers);
            wakers.finish(token.take());

            // The fetch future is destructed in place here, upholding its
            // pin.
            *guard = State::Settled(outcome);
        }

        match *guard {
            State::Settled(Ok(ref groups)) => {
                let group = groups.get(key).cloned();
                drop(guard);
                *state = None;
                match group {
                    Some(group) => Poll::Ready(Ok(group)),
                    None => panic!("no group recorded for a batched key"),
                }
            }
            State::Settled(Err(ref err)) => {
                let err = err.clone();
                drop(guard);
                *state = None;
                Poll::Ready(Err(err))
            }
            _ => unreachable!("batch state failed to settle"),
        }
    }
}

impl<R, E, F, K, D> Drop for LoadFuture<R, E, F, K, D>
where
    F: Fetcher<R, E>,
{
    fn drop(&mut self) {
        // There is no cancellation path: a dropped future leaves its key in
        // the batch, and the batch's result still lands in the cache. The
        // only cleanup needed is waker bookkeeping — the shared work is
        // driven by a single task, so if this future was the driver another
        // waiter must be woken to take over.
        if let FutureInner::Waiting { token, state, .. } = &mut self.inner {
            if let (Some(token), Some(state)) = (token.take(), state.as_ref()) {
                if let Ok(mut guard) = state.lock() {
                    match *guard {
                        State::Gathering(ref mut gather) => gather.wakers.abandon(token),
                        State::Fetching(ref mut fetching) => fetching.wakers.abandon(token),
                        State::Settled(..) => {}
                    }
                }
            }
        }
    }
}

enum ManySlot<R, E, F, K, D>
where
    F: Fetcher<R, E>,
{
    Pending(LoadFuture<R, E, F, K, D>),
    Done(Result<Group<R>, LoadError<E>>),
}

/// The pending result of a [`load_many`] call. Resolves to one per-key
/// result per input key, in input order.
///
/// [`load_many`]: Loader::load_many
pub struct LoadMany<R, E, F, K, D>
where
    F: Fetcher<R, E>,
{
    slots: Vec<ManySlot<R, E, F, K, D>>,
}

impl<R, E, F, K, D> Future for LoadMany<R, E, F, K, D>
where
    F: Fetcher<R, E>,
    K: RowKey<R>,
    E: Clone + Unpin,
    D: Future<Output = ()>,
{
    type Output = Vec<Result<Group<R>, LoadError<E>>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        let mut all_done = true;
        for slot in unpinned.slots.iter_mut() {
            if let ManySlot::Pending(fut) = slot {
                match Pin::new(fut).poll(ctx) {
                    Poll::Ready(result) => *slot = ManySlot::Done(result),
                    Poll::Pending => all_done = false,
                }
            }
        }

        if !all_done {
            return Poll::Pending;
        }

        Poll::Ready(
            mem::take(&mut unpinned.slots)
                .into_iter()
                .map(|slot| match slot {
                    ManySlot::Done(result) => result,
                    ManySlot::Pending(..) => unreachable!("pending slot after completion"),
                })
                .collect(),
        )
    }
}
