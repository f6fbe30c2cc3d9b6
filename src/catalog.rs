//! The loader catalog: one batched loader per entity and relation of the
//! observation-metadata schema.
//!
//! A [`Catalog`] is built once per incoming request, over a shared
//! [`RowSource`]. All lookups issued while resolving that request flow
//! through its loaders, so sibling resolvers asking for the same entity type
//! coalesce into single `in (...)` queries and repeated lookups resolve
//! from the request cache. Relationship types, which are near-static, are
//! instead memoized process-wide through [`ReferenceCaches`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::batch::{Fetcher, Loader, LoaderOptions, NextTick, RowKey};
use crate::cache::SharedKeyCache;
use crate::error::LoadError;
use crate::group::Group;
use crate::key::{Key, KeyList};

/// One fetched row, as a loosely typed column map.
pub type Record = serde_json::Map<String, Value>;

/// A group of rows belonging to one key.
pub type RecordGroup = Group<Record>;

/// Failure of a catalog lookup.
pub type CatalogError = LoadError<SourceError>;

/// The future a [`RowSource`] query resolves through.
pub type RowsFuture = Pin<Box<dyn Future<Output = Result<Vec<Record>, SourceError>> + Send>>;

/// A failed row-source query.
///
/// Cloneable so one failed batch query can be handed to every waiter of the
/// batch and memoized per key; the underlying cause is shared, not copied.
#[derive(Debug, Clone, Error)]
#[error("row source query failed: {0}")]
pub struct SourceError(Arc<anyhow::Error>);

impl SourceError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The underlying cause.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

/// Where catalog rows come from — a connection pool, in practice.
///
/// Queries carry a `$keys` placeholder where the implementation interpolates
/// (safely, as bind parameters) the batch's key list. Returned rows must
/// carry the tag column named by the relation so they can be grouped, and no
/// particular row order is assumed.
pub trait RowSource: Send + Sync {
    /// Run a keyed batch query: `$keys` stands for the requested key list.
    fn select_in(&self, sql: &'static str, keys: Vec<Key>) -> RowsFuture;

    /// Run an unkeyed query.
    fn select_all(&self, sql: &'static str) -> RowsFuture;
}

/// Static description of one batched relation: what to call it in logs,
/// the batch query to run, and the column that ties a row to its key.
#[derive(Debug, Clone, Copy)]
pub struct Relation {
    pub name: &'static str,
    pub sql: &'static str,
    pub key_column: &'static str,
}

/// A batch fetch function bound to one relation of a [`RowSource`].
pub struct RelationFetch<S> {
    source: Arc<S>,
    sql: &'static str,
}

impl<S> RelationFetch<S> {
    /// Bind a batch query to a source, for wiring loaders outside the
    /// stock catalog.
    pub fn new(source: Arc<S>, sql: &'static str) -> Self {
        Self { source, sql }
    }
}

// Manual impl: S itself need not be Clone behind the Arc.
impl<S> Clone for RelationFetch<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            sql: self.sql,
        }
    }
}

impl<S: RowSource> Fetcher<Record, SourceError> for RelationFetch<S> {
    type Fut = RowsFuture;

    fn fetch(&self, keys: Vec<Key>) -> RowsFuture {
        self.source.select_in(self.sql, keys)
    }
}

/// Row-to-key extraction by foreign-key column.
///
/// Reads the named column of a row and normalizes it; a missing or
/// malformed column yields no owner, which the grouper reports as a fault.
#[derive(Debug, Clone, Copy)]
pub struct FkColumn(pub &'static str);

impl RowKey<Record> for FkColumn {
    fn owner(&self, row: &Record) -> Option<Key> {
        row.get(self.0).and_then(|value| Key::normalize(value).ok())
    }
}

/// The loader type every catalog relation uses.
pub type RecordLoader<S> =
    Loader<Record, SourceError, RelationFetch<S>, FkColumn, fn() -> NextTick, NextTick>;

// Entity lookups, keyed by primary id. Spatial columns are shipped as
// GeoJSON in WGS84 rather than raw geometry.

const VARIABLES_SQL: &str = "select * from public.variables where id in ($keys)";

const PROTOCOLS_SQL: &str = "select * from public.protocols where id in ($keys)";

const RFORCINGS_SQL: &str = "select * from public.rforcings where id in ($keys)";

const RELATIONSHIP_TYPES_SQL: &str =
    "select * from public.relationship_types where id in ($keys)";

const NETWORKS_SQL: &str = "select \
     id, title, acronym, \"type\", status, start_year, end_year, \
     url_info_id, url_data_id, abstract, \
     st_asgeojson(st_transform(coverage_spatial, 4326)) coverage_spatial, \
     url_sites_id, parent_id, created_by, created_at, modified_by, \
     modified_at \
     from public.networks where id in ($keys)";

const SITES_SQL: &str = "select \
     id, \"name\", st_asgeojson(st_transform(xyz, 4326)) xyz \
     from public.sites where id in ($keys)";

const DATAPRODUCTS_SQL: &str = "select \
     id, title, publish_year, publish_date, keywords, abstract, provider, \
     author, contact, \
     st_asgeojson(st_transform(coverage_spatial, 4326)) coverage_spatial, \
     coverage_temp_start, coverage_temp_end, res_spatial, res_spatial_unit, \
     res_temperature, res_temperature_unit, uncertainty, uncertainty_unit, \
     doi, license, url_download, file_format, file_size, file_size_unit, \
     url_info, created_by, created_at, modified_by, modified_at, present \
     from public.dataproducts where id in ($keys)";

// Relation traversals, keyed by the foreign key on the near side of the
// xref. Each row is the far-side entity, tagged with that foreign key (and,
// where the xref is qualified, with the relationship type columns).

const VARIABLES_OF_PROTOCOLS_SQL: &str = "select \
     v.*, rt.name relationship_type_name, \
     rt.description relationship_type_description, x.protocol_id \
     from public.protocol_variable_xref x \
     join public.variables v on v.id = x.variable_id \
     join public.relationship_types rt on rt.id = x.relationship_type_id \
     where x.protocol_id in ($keys)";

const PROTOCOLS_OF_VARIABLES_SQL: &str = "select \
     p.*, rt.name relationship_type_name, \
     rt.description relationship_type_description, x.variable_id \
     from public.protocol_variable_xref x \
     join public.protocols p on p.id = x.protocol_id \
     join public.relationship_types rt on rt.id = x.relationship_type_id \
     where x.variable_id in ($keys)";

const RFORCINGS_OF_VARIABLES_SQL: &str = "select \
     rf.*, x.variable_id \
     from public.rforcing_variable_xref x \
     join public.rforcings rf on rf.id = x.rforcing_id \
     where x.variable_id in ($keys)";

const VARIABLES_OF_RFORCINGS_SQL: &str = "select \
     v.*, x.rforcing_id \
     from public.rforcing_variable_xref x \
     join public.variables v on v.id = x.variable_id \
     where x.rforcing_id in ($keys)";

const VARIABLES_OF_NETWORKS_SQL: &str = "select \
     v.*, x.network_id \
     from public.network_variable_xref x \
     join public.variables v on v.id = x.variable_id \
     where x.network_id in ($keys)";

const NETWORKS_OF_SITES_SQL: &str = "select \
     n.id, n.title, n.acronym, n.\"type\", n.status, n.start_year, \
     n.end_year, n.url_info_id, n.url_data_id, n.abstract, \
     st_asgeojson(st_transform(n.coverage_spatial, 4326)) coverage_spatial, \
     n.url_sites_id, n.parent_id, n.created_by, n.created_at, \
     n.modified_by, n.modified_at, x.site_id \
     from public.site_network_xref x \
     join public.networks n on n.id = x.network_id \
     where x.site_id in ($keys)";

const VARIABLES_OF_DATAPRODUCTS_SQL: &str = "select \
     v.*, x.dataproduct_id \
     from public.dataproduct_variable_xref x \
     join public.variables v on v.id = x.variable_id \
     where x.dataproduct_id in ($keys)";

const DATAPRODUCTS_OF_VARIABLES_SQL: &str = "select \
     d.id, d.title, d.publish_year, d.publish_date, d.keywords, d.abstract, \
     d.provider, d.author, d.contact, \
     st_asgeojson(st_transform(d.coverage_spatial, 4326)) coverage_spatial, \
     d.coverage_temp_start, d.coverage_temp_end, d.res_spatial, \
     d.res_spatial_unit, d.res_temperature, d.res_temperature_unit, \
     d.uncertainty, d.uncertainty_unit, d.doi, d.license, d.url_download, \
     d.file_format, d.file_size, d.file_size_unit, d.url_info, \
     d.created_by, d.created_at, d.modified_by, d.modified_at, d.present, \
     x.variable_id \
     from public.dataproduct_variable_xref x \
     join public.dataproducts d on d.id = x.dataproduct_id \
     where x.variable_id in ($keys)";

// Unkeyed listings: id scans feeding the batched loaders, raw xref listings
// for edge-centric queries, and the one aggregation this schema exposes.

const VARIABLE_IDS_SQL: &str = "select id from public.variables";
const PROTOCOL_IDS_SQL: &str = "select id from public.protocols";
const NETWORK_IDS_SQL: &str = "select id from public.networks";
const SITE_IDS_SQL: &str = "select id from public.sites";
const RFORCING_IDS_SQL: &str = "select id from public.rforcings";
const DATAPRODUCT_IDS_SQL: &str = "select id from public.dataproducts";

const PROTOCOL_VARIABLE_LINKS_SQL: &str = "select \
     x.id, x.protocol_id, x.variable_id, r.name relationship_type \
     from public.protocol_variable_xref x \
     join public.relationship_types r on r.id = x.relationship_type_id";

const DATAPRODUCT_VARIABLE_LINKS_SQL: &str =
    "select * from public.dataproduct_variable_xref";

const NETWORK_VARIABLE_LINKS_SQL: &str = "select * from public.network_variable_xref";

const SITE_NETWORK_LINKS_SQL: &str = "select * from public.site_network_xref";

const DATAPRODUCT_COUNT_SQL: &str = "select count(*) count from public.dataproducts";

/// Process-wide memoization for near-static reference tables.
///
/// Catalogs are request-scoped, but relationship types change about as often
/// as the schema does; every catalog built over the same `ReferenceCaches`
/// shares their resolved outcomes. Call [`invalidate`] after mutating the
/// underlying tables.
///
/// [`invalidate`]: ReferenceCaches::invalidate
#[derive(Debug, Default)]
pub struct ReferenceCaches {
    relationship_types: Arc<SharedKeyCache<Record, CatalogError>>,
}

impl ReferenceCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every memoized reference outcome, forcing refetches.
    pub fn invalidate(&self) {
        self.relationship_types.clear();
    }
}

/// Request-scoped registry of every loader of the schema.
pub struct Catalog<S: RowSource> {
    source: Arc<S>,

    variables: RecordLoader<S>,
    protocols: RecordLoader<S>,
    networks: RecordLoader<S>,
    sites: RecordLoader<S>,
    radiative_forcings: RecordLoader<S>,
    dataproducts: RecordLoader<S>,
    relationship_types: RecordLoader<S>,

    variables_of_protocols: RecordLoader<S>,
    protocols_of_variables: RecordLoader<S>,
    radiative_forcings_of_variables: RecordLoader<S>,
    variables_of_radiative_forcings: RecordLoader<S>,
    variables_of_networks: RecordLoader<S>,
    networks_of_sites: RecordLoader<S>,
    variables_of_dataproducts: RecordLoader<S>,
    dataproducts_of_variables: RecordLoader<S>,
}

impl<S: RowSource> Catalog<S> {
    pub fn new(source: Arc<S>, reference: &ReferenceCaches) -> Self {
        let loader = |relation: Relation| {
            Loader::new(
                RelationFetch {
                    source: Arc::clone(&source),
                    sql: relation.sql,
                },
                FkColumn(relation.key_column),
                LoaderOptions {
                    name: relation.name,
                    ..LoaderOptions::default()
                },
            )
        };

        Self {
            variables: loader(Relation {
                name: "variables",
                sql: VARIABLES_SQL,
                key_column: "id",
            }),
            protocols: loader(Relation {
                name: "protocols",
                sql: PROTOCOLS_SQL,
                key_column: "id",
            }),
            networks: loader(Relation {
                name: "networks",
                sql: NETWORKS_SQL,
                key_column: "id",
            }),
            sites: loader(Relation {
                name: "sites",
                sql: SITES_SQL,
                key_column: "id",
            }),
            radiative_forcings: loader(Relation {
                name: "radiative_forcings",
                sql: RFORCINGS_SQL,
                key_column: "id",
            }),
            dataproducts: loader(Relation {
                name: "dataproducts",
                sql: DATAPRODUCTS_SQL,
                key_column: "id",
            }),
            relationship_types: Loader::with_shared_cache(
                RelationFetch {
                    source: Arc::clone(&source),
                    sql: RELATIONSHIP_TYPES_SQL,
                },
                FkColumn("id"),
                Arc::clone(&reference.relationship_types),
                LoaderOptions {
                    name: "relationship_types",
                    ..LoaderOptions::default()
                },
            ),
            variables_of_protocols: loader(Relation {
                name: "variables_of_protocols",
                sql: VARIABLES_OF_PROTOCOLS_SQL,
                key_column: "protocol_id",
            }),
            protocols_of_variables: loader(Relation {
                name: "protocols_of_variables",
                sql: PROTOCOLS_OF_VARIABLES_SQL,
                key_column: "variable_id",
            }),
            radiative_forcings_of_variables: loader(Relation {
                name: "radiative_forcings_of_variables",
                sql: RFORCINGS_OF_VARIABLES_SQL,
                key_column: "variable_id",
            }),
            variables_of_radiative_forcings: loader(Relation {
                name: "variables_of_radiative_forcings",
                sql: VARIABLES_OF_RFORCINGS_SQL,
                key_column: "rforcing_id",
            }),
            variables_of_networks: loader(Relation {
                name: "variables_of_networks",
                sql: VARIABLES_OF_NETWORKS_SQL,
                key_column: "network_id",
            }),
            networks_of_sites: loader(Relation {
                name: "networks_of_sites",
                sql: NETWORKS_OF_SITES_SQL,
                key_column: "site_id",
            }),
            variables_of_dataproducts: loader(Relation {
                name: "variables_of_dataproducts",
                sql: VARIABLES_OF_DATAPRODUCTS_SQL,
                key_column: "dataproduct_id",
            }),
            dataproducts_of_variables: loader(Relation {
                name: "dataproducts_of_variables",
                sql: DATAPRODUCTS_OF_VARIABLES_SQL,
                key_column: "variable_id",
            }),
            source: Arc::clone(&source),
        }
    }

    pub fn variables(&self) -> &RecordLoader<S> {
        &self.variables
    }

    pub fn protocols(&self) -> &RecordLoader<S> {
        &self.protocols
    }

    pub fn networks(&self) -> &RecordLoader<S> {
        &self.networks
    }

    pub fn sites(&self) -> &RecordLoader<S> {
        &self.sites
    }

    pub fn radiative_forcings(&self) -> &RecordLoader<S> {
        &self.radiative_forcings
    }

    pub fn dataproducts(&self) -> &RecordLoader<S> {
        &self.dataproducts
    }

    pub fn relationship_types(&self) -> &RecordLoader<S> {
        &self.relationship_types
    }

    pub fn variables_of_protocols(&self) -> &RecordLoader<S> {
        &self.variables_of_protocols
    }

    pub fn protocols_of_variables(&self) -> &RecordLoader<S> {
        &self.protocols_of_variables
    }

    pub fn radiative_forcings_of_variables(&self) -> &RecordLoader<S> {
        &self.radiative_forcings_of_variables
    }

    pub fn variables_of_radiative_forcings(&self) -> &RecordLoader<S> {
        &self.variables_of_radiative_forcings
    }

    pub fn variables_of_networks(&self) -> &RecordLoader<S> {
        &self.variables_of_networks
    }

    pub fn networks_of_sites(&self) -> &RecordLoader<S> {
        &self.networks_of_sites
    }

    pub fn variables_of_dataproducts(&self) -> &RecordLoader<S> {
        &self.variables_of_dataproducts
    }

    pub fn dataproducts_of_variables(&self) -> &RecordLoader<S> {
        &self.dataproducts_of_variables
    }

    /// List an entire entity table by scanning its ids and pushing every id
    /// through the entity's batched loader, so the rows land in the same
    /// cache point lookups resolve from.
    async fn all_of(
        &self,
        ids_sql: &'static str,
        loader: &RecordLoader<S>,
    ) -> Result<Vec<Record>, CatalogError> {
        let id_rows = self
            .source
            .select_all(ids_sql)
            .await
            .map_err(LoadError::Fetch)?;

        let mut ids = KeyList::new();
        for row in &id_rows {
            let id = Key::normalize(row.get("id").unwrap_or(&Value::Null))?;
            ids.insert(&id);
        }

        let groups = loader.load_many(ids.take()).await;

        let mut records = Vec::with_capacity(id_rows.len());
        for group in groups {
            if let Some(record) = group?.first() {
                records.push(record.clone());
            }
        }
        Ok(records)
    }

    pub async fn all_variables(&self) -> Result<Vec<Record>, CatalogError> {
        self.all_of(VARIABLE_IDS_SQL, &self.variables).await
    }

    pub async fn all_protocols(&self) -> Result<Vec<Record>, CatalogError> {
        self.all_of(PROTOCOL_IDS_SQL, &self.protocols).await
    }

    pub async fn all_networks(&self) -> Result<Vec<Record>, CatalogError> {
        self.all_of(NETWORK_IDS_SQL, &self.networks).await
    }

    pub async fn all_sites(&self) -> Result<Vec<Record>, CatalogError> {
        self.all_of(SITE_IDS_SQL, &self.sites).await
    }

    pub async fn all_radiative_forcings(&self) -> Result<Vec<Record>, CatalogError> {
        self.all_of(RFORCING_IDS_SQL, &self.radiative_forcings).await
    }

    pub async fn all_dataproducts(&self) -> Result<Vec<Record>, CatalogError> {
        self.all_of(DATAPRODUCT_IDS_SQL, &self.dataproducts).await
    }

    /// Raw protocol/variable links, each qualified with its relationship
    /// type.
    pub async fn protocol_variable_links(&self) -> Result<Vec<Record>, SourceError> {
        self.source.select_all(PROTOCOL_VARIABLE_LINKS_SQL).await
    }

    pub async fn dataproduct_variable_links(&self) -> Result<Vec<Record>, SourceError> {
        self.source.select_all(DATAPRODUCT_VARIABLE_LINKS_SQL).await
    }

    pub async fn network_variable_links(&self) -> Result<Vec<Record>, SourceError> {
        self.source.select_all(NETWORK_VARIABLE_LINKS_SQL).await
    }

    pub async fn site_network_links(&self) -> Result<Vec<Record>, SourceError> {
        self.source.select_all(SITE_NETWORK_LINKS_SQL).await
    }

    /// Total number of data products. Tolerates drivers that ship bigint
    /// aggregates as strings.
    pub async fn dataproduct_count(&self) -> Result<u64, SourceError> {
        let rows = self.source.select_all(DATAPRODUCT_COUNT_SQL).await?;
        let count = rows
            .first()
            .and_then(|row| row.get("count"))
            .map(|value| match value {
                Value::Number(number) => number.as_u64().unwrap_or(0),
                Value::String(text) => text.parse().unwrap_or(0),
                _ => 0,
            })
            .unwrap_or(0);
        Ok(count)
    }
}
