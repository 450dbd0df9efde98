/// Corpus loading and the versioned read-only snapshot.
///
/// The canonical corpus is a JSON array of `ProgramRecord` written by the
/// (external) ingestion pipeline. Records are validated once here, at load:
/// malformed records are skipped with a warning and counted, never re-checked
/// at evaluation time and never fatal to the load.
///
/// Readers take an `Arc<CorpusSnapshot>` once per request, so a concurrent
/// reload can never expose a half-updated corpus mid-request.
use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::AppError;
use crate::model::{ProgramRecord, StackingRule};

/// An immutable, versioned view of the program corpus.
pub struct CorpusSnapshot {
    /// Content hash over all record hashes; changes iff any record changes.
    pub version: String,
    pub programs: HashMap<String, ProgramRecord>,
}

impl CorpusSnapshot {
    pub fn get(&self, id: &str) -> Option<&ProgramRecord> {
        self.programs.get(id)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

/// Holder for the currently published snapshot.
pub struct CorpusStore {
    current: RwLock<Arc<CorpusSnapshot>>,
}

impl CorpusStore {
    pub fn new(snapshot: CorpusSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Clone out the current snapshot. Cheap (one Arc clone); the caller keeps
    /// a consistent view for the remainder of its request.
    pub async fn snapshot(&self) -> Arc<CorpusSnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Atomically publish a new snapshot.
    pub async fn replace(&self, snapshot: CorpusSnapshot) {
        let mut current = self.current.write().await;
        *current = Arc::new(snapshot);
    }
}

/// Load and validate the corpus from a JSON file.
///
/// Returns the snapshot plus the number of records skipped for data-quality
/// reasons.
pub fn load_corpus(path: &str) -> Result<(CorpusSnapshot, usize), AppError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AppError::Corpus(format!("failed to read {path}: {e}")))?;
    let records: Vec<serde_json::Value> = serde_json::from_str(&content)
        .map_err(|e| AppError::Corpus(format!("corpus is not a JSON array: {e}")))?;

    let mut programs: HashMap<String, ProgramRecord> = HashMap::new();
    let mut ordered_ids: Vec<String> = Vec::new();
    let mut record_hashes: HashMap<String, String> = HashMap::new();
    let mut skipped = 0usize;

    for (i, value) in records.into_iter().enumerate() {
        let record: ProgramRecord = match serde_json::from_value(value.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!(index = i, error = %e, "skipping malformed corpus record");
                skipped += 1;
                continue;
            }
        };
        if let Err(reason) = validate_record(&record) {
            warn!(index = i, id = %record.id, reason, "skipping invalid corpus record");
            skipped += 1;
            continue;
        }
        if programs.contains_key(&record.id) {
            warn!(id = %record.id, "duplicate program id, keeping first occurrence");
            skipped += 1;
            continue;
        }
        record_hashes.insert(record.id.clone(), record_hash(&value));
        ordered_ids.push(record.id.clone());
        programs.insert(record.id.clone(), record);
    }

    ordered_ids.sort();
    let mut hasher = Sha256::new();
    for id in &ordered_ids {
        hasher.update(id.as_bytes());
        hasher.update(b"=");
        if let Some(h) = record_hashes.get(id) {
            hasher.update(h.as_bytes());
        }
        hasher.update(b"\n");
    }
    let version = format!("{:x}", hasher.finalize());

    info!(
        programs = programs.len(),
        skipped,
        version = %version,
        "corpus loaded"
    );

    Ok((CorpusSnapshot { version, programs }, skipped))
}

/// Data-quality checks applied once at ingestion.
fn validate_record(record: &ProgramRecord) -> Result<(), &'static str> {
    if record.id.trim().is_empty() {
        return Err("empty id");
    }
    if record.name.trim().is_empty() {
        return Err("empty name");
    }
    if record.incentive.nominal_amount() < 0.0 {
        return Err("negative incentive amount");
    }
    if let (Some(min), Some(max)) = (
        record.criteria.min_size_units,
        record.criteria.max_size_units,
    ) {
        if min > max {
            return Err("inverted size bounds");
        }
    }
    for rule in &record.stacking_rules {
        match rule {
            StackingRule::Exclude { target } if target.trim().is_empty() => {
                return Err("exclusion rule with empty target");
            }
            StackingRule::Allow { program_id } if program_id.trim().is_empty() => {
                return Err("allow rule with empty program id");
            }
            StackingRule::Cap { max_total_value } if *max_total_value <= 0.0 => {
                return Err("cap rule with non-positive ceiling");
            }
            StackingRule::Threshold { min_project_value } if *min_project_value < 0.0 => {
                return Err("threshold rule with negative floor");
            }
            _ => {}
        }
    }
    for bonus in &record.bonus_rules {
        if bonus.value < 0.0 {
            return Err("bonus rule with negative value");
        }
    }
    Ok(())
}

fn record_hash(value: &serde_json::Value) -> String {
    let canonical = value.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Incentive, ProgramStatus};

    fn write_corpus(json: &str) -> temppath::TempPath {
        temppath::write(json)
    }

    // Minimal temp-file helper so tests don't need an extra dev-dependency.
    mod temppath {
        use std::path::PathBuf;

        pub struct TempPath(pub PathBuf);

        impl TempPath {
            pub fn as_str(&self) -> &str {
                self.0.to_str().unwrap()
            }
        }

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }

        pub fn write(json: &str) -> TempPath {
            let mut path = std::env::temp_dir();
            let unique = format!(
                "corpus-test-{}-{}.json",
                std::process::id(),
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            );
            path.push(unique);
            std::fs::write(&path, json).unwrap();
            TempPath(path)
        }
    }

    #[test]
    fn loads_valid_records() {
        let file = write_corpus(
            r#"[
                {"id": "p1", "name": "Program One", "description": "solar credit",
                 "incentive": {"kind": "fixed", "amount": 1000.0}},
                {"id": "p2", "name": "Program Two", "description": "housing grant",
                 "incentive": {"kind": "per_unit", "amount": 50.0}}
            ]"#,
        );
        let (snapshot, skipped) = load_corpus(file.as_str()).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(skipped, 0);
        assert_eq!(snapshot.get("p1").unwrap().status, ProgramStatus::Active);
    }

    #[test]
    fn skips_malformed_and_invalid_records() {
        let file = write_corpus(
            r#"[
                {"id": "good", "name": "Good", "description": "x",
                 "incentive": {"kind": "fixed", "amount": 10.0}},
                {"id": "neg", "name": "Negative", "description": "x",
                 "incentive": {"kind": "fixed", "amount": -5.0}},
                {"id": "", "name": "NoId", "description": "x",
                 "incentive": {"kind": "fixed", "amount": 1.0}},
                {"name": "missing incentive"},
                {"id": "badcap", "name": "BadCap", "description": "x",
                 "incentive": {"kind": "fixed", "amount": 1.0},
                 "stacking_rules": [{"kind": "cap", "max_total_value": 0.0}]}
            ]"#,
        );
        let (snapshot, skipped) = load_corpus(file.as_str()).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("good").is_some());
        assert_eq!(skipped, 4);
    }

    #[test]
    fn duplicate_ids_keep_first() {
        let file = write_corpus(
            r#"[
                {"id": "dup", "name": "First", "description": "x",
                 "incentive": {"kind": "fixed", "amount": 1.0}},
                {"id": "dup", "name": "Second", "description": "x",
                 "incentive": {"kind": "fixed", "amount": 2.0}}
            ]"#,
        );
        let (snapshot, skipped) = load_corpus(file.as_str()).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("dup").unwrap().name, "First");
        assert_eq!(skipped, 1);
    }

    #[test]
    fn version_tracks_content() {
        let a = write_corpus(
            r#"[{"id": "p1", "name": "A", "description": "x",
                 "incentive": {"kind": "fixed", "amount": 1.0}}]"#,
        );
        let b = write_corpus(
            r#"[{"id": "p1", "name": "A", "description": "changed",
                 "incentive": {"kind": "fixed", "amount": 1.0}}]"#,
        );
        let (snap_a, _) = load_corpus(a.as_str()).unwrap();
        let (snap_a2, _) = load_corpus(a.as_str()).unwrap();
        let (snap_b, _) = load_corpus(b.as_str()).unwrap();
        assert_eq!(snap_a.version, snap_a2.version);
        assert_ne!(snap_a.version, snap_b.version);
    }

    #[test]
    fn incentive_value_uses_profile_fields() {
        let profile = crate::model::ProjectProfile {
            size_units: Some(100),
            total_cost: Some(2_000_000.0),
            ..Default::default()
        };
        assert_eq!(
            Incentive::Fixed { amount: 500.0 }.estimated_value(&profile),
            500.0
        );
        assert_eq!(
            Incentive::PerUnit { amount: 10.0 }.estimated_value(&profile),
            1_000.0
        );
        assert_eq!(
            Incentive::PctOfCost { pct: 5.0 }.estimated_value(&profile),
            100_000.0
        );
        // Absent driving field degrades to zero, never errors.
        let empty = crate::model::ProjectProfile::default();
        assert_eq!(Incentive::PerUnit { amount: 10.0 }.estimated_value(&empty), 0.0);
    }
}
