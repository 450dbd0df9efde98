/// Index build service: corpus snapshot → embeddings → LanceDB table.
///
/// Embeddings are recomputed only when a record's composed text changes:
/// vectors are cached in Redis keyed by the SHA-256 of the text, so re-running
/// a reindex after an unrelated corpus edit only embeds the touched records.
/// The table create-or-replace is the atomic publish point; the search cache
/// namespace is invalidated immediately after.
use std::sync::Arc;

use arrow_array::{ArrayRef, FixedSizeListArray, Float32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use match_common::embedding::EmbeddingClient;
use match_common::error::CommonError;
use match_common::vectordb::VectorDb;

use crate::cache::EngineCache;
use crate::corpus::CorpusSnapshot;
use crate::error::AppError;
use crate::model::ProgramRecord;
use crate::search::PROGRAM_TABLE;

pub struct IndexService {
    embedder: Arc<EmbeddingClient>,
    vectordb: Arc<VectorDb>,
    cache: Arc<EngineCache>,
}

/// Result of a reindex pass.
pub struct IndexReport {
    pub indexed: usize,
    /// Records dropped because no valid embedding could be produced for them.
    pub dropped: usize,
    /// How many vectors were reused from the content-hash cache.
    pub reused: usize,
}

impl IndexService {
    pub fn new(
        embedder: Arc<EmbeddingClient>,
        vectordb: Arc<VectorDb>,
        cache: Arc<EngineCache>,
    ) -> Self {
        Self {
            embedder,
            vectordb,
            cache,
        }
    }

    /// True when the LanceDB table does not reflect the given snapshot: the
    /// recorded version differs, or the table itself is missing.
    pub async fn needs_update(&self, snapshot: &CorpusSnapshot) -> bool {
        match self.cache.get_index_version().await {
            Some(version) if version == snapshot.version => !self.table_exists().await,
            _ => true,
        }
    }

    pub async fn table_exists(&self) -> bool {
        self.vectordb
            .get_by_id(PROGRAM_TABLE, "__nonexistent__")
            .await
            .is_ok()
    }

    /// Rebuild the table from the snapshot.
    pub async fn reindex(&self, snapshot: &CorpusSnapshot) -> Result<IndexReport, AppError> {
        let mut records: Vec<&ProgramRecord> = snapshot.programs.values().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        info!(
            programs = records.len(),
            version = %snapshot.version,
            "starting index rebuild"
        );

        let texts: Vec<String> = records.iter().map(|r| embedding_text(r)).collect();
        let hashes: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();

        let dim = self.embedder.dimensions();
        let mut vectors: Vec<Option<Vec<f32>>> = self.cache.get_embeddings(&hashes, dim).await;
        if vectors.len() != records.len() {
            // Redis degraded mid-call; treat everything as a miss.
            vectors = vec![None; records.len()];
        }
        let reused = vectors.iter().filter(|v| v.is_some()).count();

        let miss_indices: Vec<usize> = (0..records.len())
            .filter(|&i| vectors[i].is_none())
            .collect();
        if !miss_indices.is_empty() {
            let miss_texts: Vec<String> =
                miss_indices.iter().map(|&i| texts[i].clone()).collect();
            let embedded = self.embedder.embed_documents(&miss_texts).await?;
            if embedded.len() != miss_texts.len() {
                return Err(AppError::Common(CommonError::Embedding(format!(
                    "embedding count mismatch: expected {}, got {}",
                    miss_texts.len(),
                    embedded.len()
                ))));
            }
            for (&i, vector) in miss_indices.iter().zip(embedded) {
                self.cache.set_embedding(&hashes[i], &vector).await;
                vectors[i] = Some(vector);
            }
        }

        // Drop any record that still lacks a valid vector rather than failing
        // the whole batch.
        let mut kept_records: Vec<&ProgramRecord> = Vec::with_capacity(records.len());
        let mut kept_texts: Vec<&str> = Vec::with_capacity(records.len());
        let mut kept_vectors: Vec<Vec<f32>> = Vec::with_capacity(records.len());
        let mut dropped = 0usize;
        for (i, vector) in vectors.into_iter().enumerate() {
            match vector {
                Some(v) if v.len() == dim => {
                    kept_records.push(records[i]);
                    kept_texts.push(&texts[i]);
                    kept_vectors.push(v);
                }
                _ => {
                    warn!(id = %records[i].id, "dropping record without a valid embedding");
                    dropped += 1;
                }
            }
        }

        let batch = build_record_batch(&kept_records, &kept_texts, &kept_vectors, dim)?;
        let schema = batch.schema();
        self.vectordb
            .create_or_replace_table(PROGRAM_TABLE, schema, vec![batch])
            .await?;

        self.cache.invalidate_search().await;
        self.cache.set_index_version(&snapshot.version).await;

        info!(
            indexed = kept_records.len(),
            dropped,
            reused,
            version = %snapshot.version,
            "index rebuild complete"
        );
        Ok(IndexReport {
            indexed: kept_records.len(),
            dropped,
            reused,
        })
    }
}

/// The text that gets embedded and full-text indexed for one program.
pub fn embedding_text(record: &ProgramRecord) -> String {
    let mut parts: Vec<String> = vec![record.name.clone(), record.description.clone()];
    if !record.criteria.sectors.is_empty() {
        parts.push(format!("Sectors: {}", record.criteria.sectors.join(", ")));
    }
    if !record.criteria.technologies.is_empty() {
        parts.push(format!(
            "Technologies: {}",
            record.criteria.technologies.join(", ")
        ));
    }
    if let Some(state) = &record.criteria.state {
        parts.push(format!("State: {state}"));
    }
    parts.join("\n")
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn build_record_batch(
    records: &[&ProgramRecord],
    texts: &[&str],
    embeddings: &[Vec<f32>],
    dim: usize,
) -> Result<RecordBatch, AppError> {
    let embedding_dim = dim as i32;

    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
    let states: Vec<&str> = records
        .iter()
        .map(|r| r.criteria.state.as_deref().unwrap_or(""))
        .collect();
    // Single-sector column for filter pushdown; multi-sector programs are
    // rare enough that the first tag is the filterable one.
    let sectors: Vec<&str> = records
        .iter()
        .map(|r| r.criteria.sectors.first().map(|s| s.as_str()).unwrap_or(""))
        .collect();
    let statuses: Vec<&str> = records.iter().map(|r| r.status.as_str()).collect();

    let id_array: ArrayRef = Arc::new(StringArray::from(ids));
    let name_array: ArrayRef = Arc::new(StringArray::from(names));
    let state_array: ArrayRef = Arc::new(StringArray::from(states));
    let sector_array: ArrayRef = Arc::new(StringArray::from(sectors));
    let status_array: ArrayRef = Arc::new(StringArray::from(statuses));
    let text_array: ArrayRef = Arc::new(StringArray::from(texts.to_vec()));

    let flat_values: Vec<f32> = embeddings.iter().flat_map(|e| e.iter().copied()).collect();
    let values_array = Float32Array::from(flat_values);
    let embedding_array: ArrayRef = Arc::new(
        FixedSizeListArray::try_new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            embedding_dim,
            Arc::new(values_array),
            None,
        )
        .map_err(|e| {
            AppError::Common(CommonError::VectorDb(format!(
                "failed to build embedding array: {e}"
            )))
        })?,
    );

    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("state", DataType::Utf8, false),
        Field::new("sector", DataType::Utf8, false),
        Field::new("status", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new(
            "embedding",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                embedding_dim,
            ),
            false,
        ),
    ]));

    RecordBatch::try_new(
        schema,
        vec![
            id_array,
            name_array,
            state_array,
            sector_array,
            status_array,
            text_array,
            embedding_array,
        ],
    )
    .map_err(|e| {
        AppError::Common(CommonError::VectorDb(format!(
            "failed to build record batch: {e}"
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EligibilityCriteria, Incentive};

    fn record(id: &str, description: &str) -> ProgramRecord {
        ProgramRecord {
            id: id.to_string(),
            name: format!("Program {id}"),
            description: description.to_string(),
            status: Default::default(),
            categories: Vec::new(),
            criteria: EligibilityCriteria::default(),
            bonus_rules: Vec::new(),
            stacking_rules: Vec::new(),
            incentive: Incentive::Fixed { amount: 1.0 },
        }
    }

    #[test]
    fn content_hash_changes_with_text() {
        let a = record("p1", "solar rebate");
        let mut b = record("p1", "solar rebate");
        assert_eq!(
            content_hash(&embedding_text(&a)),
            content_hash(&embedding_text(&b))
        );
        b.description = "wind rebate".to_string();
        assert_ne!(
            content_hash(&embedding_text(&a)),
            content_hash(&embedding_text(&b))
        );
    }

    #[test]
    fn embedding_text_includes_criteria() {
        let mut r = record("p1", "desc");
        r.criteria.sectors = vec!["clean-energy".to_string()];
        r.criteria.technologies = vec!["solar".to_string()];
        r.criteria.state = Some("NY".to_string());
        let text = embedding_text(&r);
        assert!(text.contains("Program p1"));
        assert!(text.contains("Sectors: clean-energy"));
        assert!(text.contains("Technologies: solar"));
        assert!(text.contains("State: NY"));
    }

    #[test]
    fn record_batch_has_expected_schema() {
        let r1 = record("a", "first");
        let r2 = record("b", "second");
        let records = vec![&r1, &r2];
        let texts = vec!["first text", "second text"];
        let embeddings = vec![vec![0.0f32; 4], vec![1.0f32; 4]];
        let batch = build_record_batch(&records, &texts, &embeddings, 4).unwrap();
        assert_eq!(batch.num_rows(), 2);
        let schema = batch.schema();
        let names: Vec<&str> = schema
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect();
        assert_eq!(
            names,
            vec!["id", "name", "state", "sector", "status", "text", "embedding"]
        );
    }
}
