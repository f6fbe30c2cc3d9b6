/*!
Batched, deduplicating, per-key caching row loading, in the style of
facebook's [dataloader].

The problem this crate solves is the N+1 query pattern: a request handler
(a GraphQL resolver tree, typically) issues many small point lookups for
the same kind of entity in the same scheduling tick, and each one would
naively become its own database round trip. A [`Loader`] collects those
lookups instead: every `load` issued while a batch is gathering joins it,
duplicate keys collapse into one slot, and when the dispatch window closes
(or the batch hits its size limit) a single batch fetch runs for all of
them. The flat result is grouped back per key and every caller's future
resolves with exactly its own rows.

Outcomes are memoized per key for the lifetime of the loader, failures
included, so loaders are meant to be request-scoped: build them per
incoming request and drop them with it. The mutation pattern is write,
[`evict`], re-load.

```
use rowloader::{Key, Loader, LoaderOptions};
use std::convert::Infallible;

#[derive(Clone)]
struct Measurement {
    station_id: i64,
    co2_ppm: f64,
}

async fn fetch_measurements(keys: Vec<Key>) -> Result<Vec<Measurement>, Infallible> {
    // One query for the whole batch, in practice. Rows come back flat,
    // tagged with the station they belong to.
    Ok(keys
        .iter()
        .filter_map(Key::as_id)
        .map(|station_id| Measurement {
            station_id,
            co2_ppm: 412.5,
        })
        .collect())
}

let loader = Loader::new(
    fetch_measurements,
    |row: &Measurement| Some(Key::Id(row.station_id)),
    LoaderOptions::default(),
);

futures::executor::block_on(async {
    // Polled together, these share one call to fetch_measurements.
    let (first, second) = futures::join!(loader.load(1), loader.load(2));
    assert_eq!(first.unwrap()[0].station_id, 1);
    assert_eq!(second.unwrap()[0].station_id, 2);
});
```

On top of the generic loader, a [`Catalog`] binds one loader to each
entity and relation of an observation-metadata schema (variables,
protocols, measurement networks, sites, radiative forcings, data products
and the cross-reference edges between them), over a pluggable
[`RowSource`].

The whole crate is runtime agnostic: batches are driven entirely by the
polls of the futures waiting on them, with no spawned tasks and no timer
requirement, so it works under any executor.

[dataloader]: https://github.com/graphql/dataloader
[`evict`]: Loader::evict
*/

mod batch;
mod cache;
mod catalog;
mod error;
mod group;
mod key;
mod wakerset;

pub use batch::{
    next_tick, Fetcher, LoadFuture, LoadMany, Loader, LoaderOptions, NextTick, RowKey,
    DEFAULT_MAX_BATCH_SIZE,
};
pub use cache::{KeyCache, Outcome, SharedKeyCache};
pub use catalog::{
    Catalog, CatalogError, FkColumn, Record, RecordGroup, RecordLoader, ReferenceCaches, Relation,
    RelationFetch, RowSource, RowsFuture, SourceError,
};
pub use error::{GroupingFault, KeyError, LoadError};
pub use group::{group_rows, Group};
pub use key::{IntoKey, Key};
