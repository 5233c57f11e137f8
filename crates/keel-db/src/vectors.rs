//! Vector collection manager.
//!
//! Every collection is a table `keel_vectors.<name>` with an `embedding
//! vector(dim)` column, a JSONB payload and an optional ivfflat or hnsw index
//! named `<name>_ann`. Metadata and the maintained row count live in
//! `vector_collections`.

use std::time::Instant;

use async_trait::async_trait;
use pgvector::Vector;
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Executor, Pool, Postgres, Row};
use tracing::{debug, info, warn};

use keel_core::tuning::derive_index_config;
use keel_core::{
    defaults, CreateCollectionRequest, DistanceMetric, Error, IndexConfig, IndexType,
    RecallTarget, Result, SearchRequest, SearchResult, TuningConfig, VectorCollection,
    VectorRepository,
};

use crate::validation::{
    collection_index, collection_index_next, collection_table, validate_collection_name,
};

const COLLECTION_COLUMNS: &str = "name, dimension, metric, index_type, index_config, row_count, \
     reindex_row_count, last_reindex_at, created_at";

/// Upper bound pgvector accepts for hnsw.ef_search.
const MAX_EF_SEARCH: i32 = 1000;

/// SQLSTATE undefined_table.
const UNDEFINED_TABLE: &str = "42P01";

/// PostgreSQL implementation of VectorRepository.
#[derive(Clone)]
pub struct PgVectorRepository {
    pool: Pool<Postgres>,
    tuning: TuningConfig,
}

impl PgVectorRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            tuning: TuningConfig::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: TuningConfig) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn tuning(&self) -> &TuningConfig {
        &self.tuning
    }

    fn parse_collection_row(row: &PgRow) -> Result<VectorCollection> {
        let metric: String = row.try_get("metric")?;
        let index_type: String = row.try_get("index_type")?;
        let Json(index_config): Json<IndexConfig> = row.try_get("index_config")?;
        Ok(VectorCollection {
            name: row.try_get("name")?,
            dimension: row.try_get("dimension")?,
            metric: metric.parse()?,
            index_type: index_type.parse()?,
            index_config,
            row_count: row.try_get("row_count")?,
            reindex_row_count: row.try_get("reindex_row_count")?,
            last_reindex_at: row.try_get("last_reindex_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn require_collection(&self, name: &str) -> Result<VectorCollection> {
        self.get_collection(name)
            .await?
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    /// Build the replacement index and swap it in. Runs outside any
    /// transaction because of CONCURRENTLY.
    async fn rebuild(
        &self,
        conn: &mut PoolConnection<Postgres>,
        collection: &VectorCollection,
        target: RecallTarget,
    ) -> Result<IndexConfig> {
        let name = collection.name.as_str();
        let table = collection_table(name);
        let index = format!("{}.{}", defaults::VECTOR_SCHEMA, collection_index(name));
        let next = format!("{}.{}", defaults::VECTOR_SCHEMA, collection_index_next(name));

        // Sizes the new index only. row_count is maintained by upsert and
        // delete, which may land while the index builds.
        let rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&mut **conn)
            .await
            .map_err(|e| missing_collection(e, name))?;

        let config = derive_index_config(
            collection.index_type,
            rows,
            target,
            &collection.index_config,
            &self.tuning,
        );

        match index_ddl(
            &collection_index_next(name),
            &table,
            collection.metric,
            collection.index_type,
            &config,
        ) {
            Some(create) => {
                if collection.dimension > defaults::VECTOR_MAX_INDEXED_DIMENSION {
                    return Err(Error::InvalidInput(format!(
                        "approximate indexes support at most {} dimensions",
                        defaults::VECTOR_MAX_INDEXED_DIMENSION
                    )));
                }
                // A crashed rebuild can leave an invalid *_next index behind.
                (&mut **conn).execute(sqlx::raw_sql(&format!("DROP INDEX CONCURRENTLY IF EXISTS {next}")))
                    .await?;
                (&mut **conn).execute(sqlx::raw_sql(&create)).await?;
                (&mut **conn).execute(sqlx::raw_sql(&format!("DROP INDEX CONCURRENTLY IF EXISTS {index}")))
                    .await?;
                (&mut **conn).execute(sqlx::raw_sql(&format!(
                    "ALTER INDEX {next} RENAME TO {}",
                    collection_index(name)
                )))
                .await?;
            }
            None => {
                (&mut **conn).execute(sqlx::raw_sql(&format!("DROP INDEX CONCURRENTLY IF EXISTS {index}")))
                    .await?;
            }
        }

        sqlx::query(
            "UPDATE vector_collections
             SET index_config = $2, reindex_row_count = $3, last_reindex_at = NOW()
             WHERE name = $1",
        )
        .bind(name)
        .bind(Json(&config))
        .bind(rows)
        .execute(&mut **conn)
        .await
        .map_err(Error::Database)?;

        Ok(config)
    }
}

/// Map a missing collection table to `UnknownCollection`.
///
/// The metadata row can be read just before a concurrent drop removes the
/// table.
fn missing_collection(e: sqlx::Error, name: &str) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some(UNDEFINED_TABLE) {
            return Error::UnknownCollection(name.to_string());
        }
    }
    Error::Database(e)
}

/// Tuning for a new collection: values derived for an empty corpus,
/// overridden by whatever the caller set explicitly.
fn initial_index_config(
    index_type: IndexType,
    explicit: &IndexConfig,
    tuning: &TuningConfig,
) -> IndexConfig {
    let derived = derive_index_config(index_type, 0, explicit.recall_target, explicit, tuning);
    if !index_type.is_approximate() {
        return derived;
    }
    IndexConfig {
        lists: explicit.lists.or(derived.lists),
        probes: explicit.probes.or(derived.probes),
        m: derived.m,
        ef_construction: derived.ef_construction,
        ef_search: explicit.ef_search.or(derived.ef_search),
        recall_target: explicit.recall_target,
    }
}

/// CREATE INDEX statement for an approximate index, `None` otherwise.
///
/// `index` is unqualified; PostgreSQL places it in the table's schema.
fn index_ddl(
    index: &str,
    table: &str,
    metric: DistanceMetric,
    index_type: IndexType,
    config: &IndexConfig,
) -> Option<String> {
    let method = index_type.access_method()?;
    let with = match index_type {
        IndexType::Ivf => format!("lists = {}", config.lists.unwrap_or(1).max(1)),
        _ => format!(
            "m = {}, ef_construction = {}",
            config.m.unwrap_or(defaults::GRAPH_M),
            config
                .ef_construction
                .unwrap_or(defaults::GRAPH_EF_CONSTRUCTION)
        ),
    };
    Some(format!(
        "CREATE INDEX CONCURRENTLY {index} ON {table} USING {method} (embedding {}) WITH ({with})",
        metric.opclass()
    ))
}

/// Transaction-local planner settings applied before a search.
fn search_settings(index_type: IndexType, config: &IndexConfig, k: i64) -> Option<String> {
    match index_type {
        IndexType::Exact => Some("SET LOCAL enable_indexscan = off".to_string()),
        IndexType::Ivf => config
            .probes
            .map(|p| format!("SET LOCAL ivfflat.probes = {}", p.max(1))),
        IndexType::Graph => {
            let k = i32::try_from(k).unwrap_or(MAX_EF_SEARCH);
            let ef = config
                .ef_search
                .unwrap_or(RecallTarget::default().base_ef())
                .max(k)
                .min(MAX_EF_SEARCH);
            Some(format!("SET LOCAL hnsw.ef_search = {ef}"))
        }
        IndexType::None => None,
    }
}

fn check_finite(vector: &[f32]) -> Result<()> {
    if vector.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(Error::InvalidInput(
            "vector components must be finite".to_string(),
        ))
    }
}

#[async_trait]
impl VectorRepository for PgVectorRepository {
    async fn create_collection(
        &self,
        request: CreateCollectionRequest,
    ) -> Result<VectorCollection> {
        validate_collection_name(&request.name)?;
        if request.dimension < 1 || request.dimension > defaults::VECTOR_MAX_DIMENSION {
            return Err(Error::InvalidInput(format!(
                "dimension must be between 1 and {}, got {}",
                defaults::VECTOR_MAX_DIMENSION,
                request.dimension
            )));
        }
        if request.index_type.is_approximate()
            && request.dimension > defaults::VECTOR_MAX_INDEXED_DIMENSION
        {
            return Err(Error::InvalidInput(format!(
                "{} indexes support at most {} dimensions, got {}",
                request.index_type,
                defaults::VECTOR_MAX_INDEXED_DIMENSION,
                request.dimension
            )));
        }

        let name = request.name.as_str();
        let table = collection_table(name);
        let config = initial_index_config(request.index_type, &request.index_config, &self.tuning);

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "INSERT INTO vector_collections (name, dimension, metric, index_type, index_config)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (name) DO NOTHING
             RETURNING {COLLECTION_COLUMNS}"
        ))
        .bind(name)
        .bind(request.dimension)
        .bind(request.metric.as_str())
        .bind(request.index_type.as_str())
        .bind(Json(&config))
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            return Err(Error::CollectionExists(name.to_string()));
        };
        let collection = Self::parse_collection_row(&row)?;

        (&mut *tx).execute(sqlx::raw_sql(&format!(
            "CREATE TABLE {table} (
                 id          TEXT PRIMARY KEY,
                 embedding   vector({dim}) NOT NULL,
                 payload     JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                 created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                 updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
             );
             CREATE INDEX {name}_payload ON {table} USING gin (payload jsonb_path_ops);",
            dim = request.dimension,
        )))
        .await?;

        // hnsw maintains itself on insert, so it is built up front. ivfflat
        // needs data to train its lists and waits for the first reindex.
        if request.index_type == IndexType::Graph {
            if let Some(ddl) = index_ddl(
                &collection_index(name),
                &table,
                request.metric,
                request.index_type,
                &config,
            ) {
                let ddl = ddl.replacen("CREATE INDEX CONCURRENTLY", "CREATE INDEX", 1);
                (&mut *tx).execute(sqlx::raw_sql(&ddl)).await?;
            }
        }

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "vectors",
            component = "collections",
            op = "create",
            collection = %name,
            dimension = request.dimension,
            metric = %request.metric,
            index_type = %request.index_type,
            "Collection created"
        );
        Ok(collection)
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        validate_collection_name(name)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let deleted = sqlx::query("DELETE FROM vector_collections WHERE name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();
        if deleted == 0 {
            return Err(Error::UnknownCollection(name.to_string()));
        }

        (&mut *tx).execute(sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {}", collection_table(name))))
            .await?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "vectors",
            component = "collections",
            op = "drop",
            collection = %name,
            "Collection dropped"
        );
        Ok(())
    }

    async fn get_collection(&self, name: &str) -> Result<Option<VectorCollection>> {
        let row = sqlx::query(&format!(
            "SELECT {COLLECTION_COLUMNS} FROM vector_collections WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_collection_row).transpose()
    }

    async fn list_collections(&self) -> Result<Vec<VectorCollection>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLLECTION_COLUMNS} FROM vector_collections ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_collection_row).collect()
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        payload: JsonValue,
    ) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidInput("embedding id must not be empty".into()));
        }
        let meta = self.require_collection(collection).await?;
        meta.check_dimension(vector.len())?;
        check_finite(vector)?;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let inserted: bool = sqlx::query_scalar(&format!(
            "INSERT INTO {} (id, embedding, payload)
             VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE
             SET embedding = EXCLUDED.embedding, payload = EXCLUDED.payload, updated_at = NOW()
             RETURNING (xmax = 0) AS inserted",
            collection_table(collection)
        ))
        .bind(id)
        .bind(Vector::from(vector.to_vec()))
        .bind(&payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| missing_collection(e, collection))?;

        if inserted {
            sqlx::query("UPDATE vector_collections SET row_count = row_count + 1 WHERE name = $1")
                .bind(collection)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "vectors",
            component = "store",
            op = "upsert",
            collection = %collection,
            inserted,
            "Embedding stored"
        );
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        self.require_collection(collection).await?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1",
            collection_table(collection)
        ))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| missing_collection(e, collection))?
        .rows_affected()
            > 0;

        if deleted {
            sqlx::query(
                "UPDATE vector_collections SET row_count = GREATEST(row_count - 1, 0)
                 WHERE name = $1",
            )
            .bind(collection)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(deleted)
    }

    async fn search(
        &self,
        collection: &str,
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>> {
        if request.k < 1 {
            return Err(Error::InvalidInput(format!(
                "k must be at least 1, got {}",
                request.k
            )));
        }
        let meta = self.require_collection(collection).await?;
        meta.check_dimension(request.vector.len())?;
        check_finite(&request.vector)?;

        let start = Instant::now();
        let op = meta.metric.operator();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if let Some(setting) = search_settings(meta.index_type, &meta.index_config, request.k) {
            sqlx::query(&setting)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }

        let rows = sqlx::query(&format!(
            "SELECT id, payload, (embedding {op} $1)::float8 AS distance
             FROM {}
             WHERE ($3::jsonb IS NULL OR payload @> $3)
             ORDER BY embedding {op} $1
             LIMIT $2",
            collection_table(collection)
        ))
        .bind(Vector::from(request.vector.clone()))
        .bind(request.k)
        .bind(request.filter.as_ref())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| missing_collection(e, collection))?;

        tx.commit().await.map_err(Error::Database)?;

        let results = rows
            .iter()
            .map(|row| {
                let distance: f64 = row.try_get("distance")?;
                Ok(SearchResult {
                    id: row.try_get("id")?,
                    score: meta.metric.score(distance),
                    distance,
                    payload: row.try_get("payload")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            subsystem = "vectors",
            component = "search",
            op = "search",
            collection = %collection,
            index_type = %meta.index_type,
            k = request.k,
            filtered = request.filter.is_some(),
            result_count = results.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Vector search complete"
        );
        Ok(results)
    }

    async fn count(&self, collection: &str) -> Result<i64> {
        validate_collection_name(collection)?;
        sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {}",
            collection_table(collection)
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| missing_collection(e, collection))
    }

    async fn reindex(
        &self,
        collection: &str,
        recall_target: Option<RecallTarget>,
    ) -> Result<IndexConfig> {
        let meta = self.require_collection(collection).await?;
        let target = recall_target.unwrap_or(meta.index_config.recall_target);
        let start = Instant::now();

        // CREATE INDEX CONCURRENTLY cannot run in a transaction, so the guard
        // is a session lock held on one dedicated connection.
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        let lock_key = format!("keel_reindex:{}", collection);

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(&lock_key)
            .fetch_one(&mut *conn)
            .await
            .map_err(Error::Database)?;
        if !locked {
            return Err(Error::ReindexInProgress(collection.to_string()));
        }

        let result = self.rebuild(&mut conn, &meta, target).await;

        let unlocked = sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&lock_key)
            .execute(&mut *conn)
            .await;
        if let Err(e) = unlocked {
            // Closing the session releases the lock.
            warn!(
                subsystem = "vectors",
                component = "reindex",
                collection = %collection,
                error = %e,
                "Advisory unlock failed, closing connection"
            );
            drop(conn.detach());
        }

        let config = result?;
        info!(
            subsystem = "vectors",
            component = "reindex",
            op = "reindex",
            collection = %collection,
            index_type = %meta.index_type,
            recall_target = target.as_str(),
            lists = ?config.lists,
            probes = ?config.probes,
            ef_search = ?config.ef_search,
            duration_ms = start.elapsed().as_millis() as u64,
            "Collection reindexed"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ivf_index_ddl() {
        let config = IndexConfig {
            lists: Some(100),
            ..Default::default()
        };
        let ddl = index_ddl(
            "docs_ann_next",
            "keel_vectors.docs",
            DistanceMetric::Euclidean,
            IndexType::Ivf,
            &config,
        )
        .unwrap();
        assert_eq!(
            ddl,
            "CREATE INDEX CONCURRENTLY docs_ann_next ON keel_vectors.docs \
             USING ivfflat (embedding vector_l2_ops) WITH (lists = 100)"
        );
    }

    #[test]
    fn test_graph_index_ddl_uses_defaults() {
        let ddl = index_ddl(
            "docs_ann",
            "keel_vectors.docs",
            DistanceMetric::Cosine,
            IndexType::Graph,
            &IndexConfig::default(),
        )
        .unwrap();
        assert!(ddl.contains("USING hnsw (embedding vector_cosine_ops)"));
        assert!(ddl.contains("m = 16, ef_construction = 64"));
    }

    #[test]
    fn test_no_ddl_without_approximate_index() {
        for index_type in [IndexType::Exact, IndexType::None] {
            assert!(index_ddl(
                "docs_ann",
                "keel_vectors.docs",
                DistanceMetric::Dot,
                index_type,
                &IndexConfig::default()
            )
            .is_none());
        }
    }

    #[test]
    fn test_search_settings() {
        assert_eq!(
            search_settings(IndexType::Exact, &IndexConfig::default(), 10).as_deref(),
            Some("SET LOCAL enable_indexscan = off")
        );
        assert!(search_settings(IndexType::None, &IndexConfig::default(), 10).is_none());

        let ivf = IndexConfig {
            lists: Some(100),
            probes: Some(20),
            ..Default::default()
        };
        assert_eq!(
            search_settings(IndexType::Ivf, &ivf, 10).as_deref(),
            Some("SET LOCAL ivfflat.probes = 20")
        );
    }

    #[test]
    fn test_graph_search_breadth_covers_k() {
        let config = IndexConfig {
            ef_search: Some(40),
            ..Default::default()
        };
        assert_eq!(
            search_settings(IndexType::Graph, &config, 10).as_deref(),
            Some("SET LOCAL hnsw.ef_search = 40")
        );
        assert_eq!(
            search_settings(IndexType::Graph, &config, 150).as_deref(),
            Some("SET LOCAL hnsw.ef_search = 150")
        );
        assert_eq!(
            search_settings(IndexType::Graph, &config, 5000).as_deref(),
            Some("SET LOCAL hnsw.ef_search = 1000")
        );
    }

    #[test]
    fn test_initial_config_keeps_explicit_values() {
        let explicit = IndexConfig {
            lists: Some(50),
            recall_target: RecallTarget::High,
            ..Default::default()
        };
        let config = initial_index_config(IndexType::Ivf, &explicit, &TuningConfig::default());
        assert_eq!(config.lists, Some(50));
        assert!(config.probes.is_some());
        assert_eq!(config.recall_target, RecallTarget::High);
    }

    #[test]
    fn test_initial_graph_config_fills_build_parameters() {
        let config = initial_index_config(
            IndexType::Graph,
            &IndexConfig::default(),
            &TuningConfig::default(),
        );
        assert_eq!(config.m, Some(defaults::GRAPH_M));
        assert_eq!(config.ef_construction, Some(defaults::GRAPH_EF_CONSTRUCTION));
        assert!(config.ef_search.is_some());
    }

    #[test]
    fn test_initial_exact_config_has_no_parameters() {
        let config = initial_index_config(
            IndexType::Exact,
            &IndexConfig {
                lists: Some(9),
                ..Default::default()
            },
            &TuningConfig::default(),
        );
        assert_eq!(config.lists, None);
    }

    #[test]
    fn test_non_finite_vectors_rejected() {
        assert!(check_finite(&[0.1, 0.2]).is_ok());
        assert!(check_finite(&[f32::NAN]).is_err());
        assert!(check_finite(&[f32::INFINITY, 0.0]).is_err());
    }
}
