/// LanceDB wrapper for the incentive-program index.
///
/// One table holds both retrieval surfaces: an embedding column for
/// approximate-nearest-neighbor search and a text column carrying a full-text
/// (BM25) index. Structural filters (state, sector, status) are pushed down as
/// SQL predicates on both query paths.
///
/// Table schema:
/// - id: Utf8 (not null)
/// - name: Utf8 (not null)
/// - state: Utf8 (not null, "" when the program is not state-scoped)
/// - sector: Utf8 (not null, "" when the program is sector-agnostic)
/// - status: Utf8 (not null)
/// - text: Utf8 (not null) — the text that was embedded, also FTS-indexed
/// - embedding: FixedSizeList<Float32, dim> (not null)
use std::sync::Arc;

use arrow_array::{RecordBatch, RecordBatchIterator};
use arrow_schema::Schema;
use lancedb::index::scalar::{FtsIndexBuilder, FullTextSearchQuery};
use lancedb::index::Index;
use lancedb::query::{ExecutableQuery, QueryBase};
use tracing::info;

use crate::error::CommonError;

pub struct VectorDb {
    db: lancedb::Connection,
}

impl VectorDb {
    /// Connect to a LanceDB database at the given filesystem path.
    pub async fn connect(path: &str) -> Result<Self, CommonError> {
        let db = lancedb::connect(path)
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("connection failed: {e}")))?;
        Ok(Self { db })
    }

    /// Create or replace a table with the given schema and data, then build the
    /// full-text index on the `text` column.
    ///
    /// Drop-and-recreate is the atomic publish point for index updates: readers
    /// of the previous table are unaffected until the new one lands, and
    /// re-indexing a corpus of a few thousand programs is cheap.
    pub async fn create_or_replace_table(
        &self,
        table_name: &str,
        schema: Arc<Schema>,
        batches: Vec<RecordBatch>,
    ) -> Result<(), CommonError> {
        // Drop existing table if present (ignore errors — table may not exist)
        let _ = self.db.drop_table(table_name).await;

        let batch_iter = RecordBatchIterator::new(batches.into_iter().map(Ok), schema);
        let table = self
            .db
            .create_table(table_name, Box::new(batch_iter))
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("create table failed: {e}")))?;

        table
            .create_index(&["text"], Index::FTS(FtsIndexBuilder::default()))
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("full-text index failed: {e}")))?;

        info!(table = table_name, "program index table created");
        Ok(())
    }

    /// Approximate-nearest-neighbor search over the embedding column.
    ///
    /// Returns up to `limit` rows as RecordBatches including the `_distance`
    /// column added by LanceDB (L2, lower is more similar). `filter` is a
    /// DataFusion SQL predicate applied before ranking.
    pub async fn vector_search(
        &self,
        table_name: &str,
        query_embedding: &[f32],
        filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RecordBatch>, CommonError> {
        let table = self.open_table(table_name).await?;

        let mut query = table
            .vector_search(query_embedding)
            .map_err(|e| CommonError::VectorDb(format!("vector search setup failed: {e}")))?
            .limit(limit);
        if let Some(predicate) = filter {
            query = query.only_if(predicate.to_string());
        }

        let results = query
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("vector search failed: {e}")))?;

        futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e| CommonError::VectorDb(format!("collecting search results failed: {e}")))
    }

    /// BM25 full-text search over the `text` column.
    ///
    /// Returns up to `limit` rows as RecordBatches including the `_score`
    /// column added by LanceDB (higher is more relevant).
    pub async fn full_text_search(
        &self,
        table_name: &str,
        query_text: &str,
        filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RecordBatch>, CommonError> {
        let table = self.open_table(table_name).await?;

        let mut query = table
            .query()
            .full_text_search(FullTextSearchQuery::new(query_text.to_string()))
            .limit(limit);
        if let Some(predicate) = filter {
            query = query.only_if(predicate.to_string());
        }

        let results = query
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("full-text search failed: {e}")))?;

        futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e| CommonError::VectorDb(format!("collecting search results failed: {e}")))
    }

    /// Look up a single row by its `id` column value.
    ///
    /// Returns `None` if the id is not found. Returns the first match if multiple exist.
    pub async fn get_by_id(
        &self,
        table_name: &str,
        id: &str,
    ) -> Result<Option<RecordBatch>, CommonError> {
        let table = self.open_table(table_name).await?;

        // LanceDB uses DataFusion SQL syntax for filters.
        let filter = format!("id = '{}'", id.replace('\'', "''"));
        let results = table
            .query()
            .only_if(filter)
            .limit(1)
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("query by id failed: {e}")))?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e| CommonError::VectorDb(format!("collecting query results failed: {e}")))?;

        Ok(batches.into_iter().next().filter(|b| b.num_rows() > 0))
    }

    async fn open_table(&self, table_name: &str) -> Result<lancedb::Table, CommonError> {
        self.db
            .open_table(table_name)
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("open table failed: {e}")))
    }
}
