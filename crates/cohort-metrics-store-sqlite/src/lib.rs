#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use cohort_metrics_core::{
    Dataset, Document, MetricsError, RecordSource, SnapshotSink, SnapshotTable,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const COHORT_MIGRATION_VERSION: i64 = 1;
const STORE_STATUS_CONTRACT_VERSION: &str = "store_status.v1";

const SCHEMA_COHORT_V1: &str = r"
CREATE TABLE IF NOT EXISTS learners (
  record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  document_json TEXT NOT NULL,
  imported_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS activity_logs (
  record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  document_json TEXT NOT NULL,
  imported_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS outcomes (
  record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  document_json TEXT NOT NULL,
  imported_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_learner_snapshot (
  row_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  snapshot_id TEXT NOT NULL,
  written_at TEXT NOT NULL,
  document_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS grouped_metrics_snapshot (
  row_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  snapshot_id TEXT NOT NULL,
  written_at TEXT NOT NULL,
  document_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_raw_learner_snapshot_id
  ON raw_learner_snapshot(snapshot_id);
CREATE INDEX IF NOT EXISTS idx_grouped_metrics_snapshot_id
  ON grouped_metrics_snapshot(snapshot_id);
";

/// SQLite-backed document collections plus the two snapshot tables.
pub struct SqliteCohortStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub table: SnapshotTable,
    pub rows: usize,
    pub snapshot_id: Option<String>,
    pub written_at: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StoreStatus {
    pub contract_version: String,
    pub schema_version: Option<i64>,
    pub learners: usize,
    pub logs: usize,
    pub outcomes: usize,
    pub raw_snapshot: SnapshotInfo,
    pub grouped_snapshot: SnapshotInfo,
}

impl SqliteCohortStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_COHORT_V1)
            .context("failed to apply cohort metrics schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![COHORT_MIGRATION_VERSION, now_rfc3339()?],
            )
            .context("failed to register cohort metrics schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read schema version")
    }

    /// Appends documents to a raw collection in one transaction.
    pub fn import_documents(&mut self, dataset: Dataset, documents: &[Document]) -> Result<usize> {
        let table = collection_table(dataset);
        let now = now_rfc3339()?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start import transaction")?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT INTO {table}(document_json, imported_at) VALUES (?1, ?2)"
                ))
                .with_context(|| format!("failed to prepare insert into {table}"))?;
            for document in documents {
                let payload = serde_json::to_string(document)
                    .with_context(|| format!("failed to serialize {dataset} document"))?;
                stmt.execute(params![payload, now])
                    .with_context(|| format!("failed to insert {dataset} document"))?;
            }
        }
        tx.commit().context("failed to commit import transaction")?;

        debug!(dataset = %dataset, imported = documents.len(), "imported documents");
        Ok(documents.len())
    }

    pub fn clear_collection(&self, dataset: Dataset) -> Result<usize> {
        let table = collection_table(dataset);
        self.conn
            .execute(&format!("DELETE FROM {table}"), [])
            .with_context(|| format!("failed to clear {table}"))
    }

    pub fn collection_count(&self, dataset: Dataset) -> Result<usize> {
        count_rows(&self.conn, collection_table(dataset))
    }

    pub fn read_collection(&self, dataset: Dataset) -> Result<Vec<Document>> {
        read_documents(
            &self.conn,
            &format!(
                "SELECT document_json FROM {} ORDER BY record_seq ASC",
                collection_table(dataset)
            ),
        )
    }

    pub fn read_snapshot(&self, table: SnapshotTable) -> Result<Vec<Document>> {
        read_documents(
            &self.conn,
            &format!(
                "SELECT document_json FROM {} ORDER BY row_seq ASC",
                snapshot_table(table)
            ),
        )
    }

    pub fn snapshot_info(&self, table: SnapshotTable) -> Result<SnapshotInfo> {
        let name = snapshot_table(table);
        let rows = count_rows(&self.conn, name)?;
        let latest = self
            .conn
            .query_row(
                &format!(
                    "SELECT snapshot_id, written_at FROM {name} ORDER BY row_seq DESC LIMIT 1"
                ),
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read latest batch of {name}"))?;

        let (snapshot_id, written_at) = match latest {
            Some((snapshot_id, written_at)) => (Some(snapshot_id), Some(written_at)),
            None => (None, None),
        };

        Ok(SnapshotInfo {
            table,
            rows,
            snapshot_id,
            written_at,
        })
    }

    pub fn store_status(&self) -> Result<StoreStatus> {
        Ok(StoreStatus {
            contract_version: STORE_STATUS_CONTRACT_VERSION.to_string(),
            schema_version: self.schema_version()?,
            learners: self.collection_count(Dataset::Learners)?,
            logs: self.collection_count(Dataset::Logs)?,
            outcomes: self.collection_count(Dataset::Outcomes)?,
            raw_snapshot: self.snapshot_info(SnapshotTable::RawLearners)?,
            grouped_snapshot: self.snapshot_info(SnapshotTable::GroupedMetrics)?,
        })
    }

    fn insert_snapshot_rows(&mut self, table: SnapshotTable, documents: &[Document]) -> Result<()> {
        let name = snapshot_table(table);
        let snapshot_id = Ulid::new().to_string();
        let written_at = now_rfc3339()?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start snapshot transaction")?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT INTO {name}(snapshot_id, written_at, document_json) VALUES (?1, ?2, ?3)"
                ))
                .with_context(|| format!("failed to prepare insert into {name}"))?;
            for document in documents {
                let payload = serde_json::to_string(document)
                    .with_context(|| format!("failed to serialize {table} row"))?;
                stmt.execute(params![snapshot_id, written_at, payload])
                    .with_context(|| format!("failed to insert {table} row"))?;
            }
        }
        tx.commit().context("failed to commit snapshot transaction")?;

        debug!(table = %table, rows = documents.len(), snapshot_id = %snapshot_id, "wrote snapshot");
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl RecordSource for SqliteCohortStore {
    fn fetch_learners(&self) -> Result<Vec<Document>, MetricsError> {
        self.read_collection(Dataset::Learners)
            .map_err(|err| MetricsError::storage("fetch learners", err))
    }

    fn fetch_logs(&self) -> Result<Vec<Document>, MetricsError> {
        self.read_collection(Dataset::Logs)
            .map_err(|err| MetricsError::storage("fetch logs", err))
    }

    fn fetch_outcomes(&self) -> Result<Vec<Document>, MetricsError> {
        self.read_collection(Dataset::Outcomes)
            .map_err(|err| MetricsError::storage("fetch outcomes", err))
    }
}

impl SnapshotSink for SqliteCohortStore {
    fn delete_all(&mut self, table: SnapshotTable) -> Result<(), MetricsError> {
        let deleted = self
            .conn
            .execute(&format!("DELETE FROM {}", snapshot_table(table)), [])
            .map_err(|err| MetricsError::storage("snapshot delete", err))?;
        debug!(table = %table, deleted, "cleared snapshot");
        Ok(())
    }

    fn insert_many(
        &mut self,
        table: SnapshotTable,
        documents: &[Document],
    ) -> Result<(), MetricsError> {
        self.insert_snapshot_rows(table, documents)
            .map_err(|err| MetricsError::storage("snapshot insert", err))
    }
}

fn collection_table(dataset: Dataset) -> &'static str {
    match dataset {
        Dataset::Learners => "learners",
        Dataset::Logs => "activity_logs",
        Dataset::Outcomes => "outcomes",
    }
}

fn snapshot_table(table: SnapshotTable) -> &'static str {
    match table {
        SnapshotTable::RawLearners => "raw_learner_snapshot",
        SnapshotTable::GroupedMetrics => "grouped_metrics_snapshot",
    }
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn count_rows(conn: &Connection, table_name: &str) -> Result<usize> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table_name}"), [], |row| {
            row.get(0)
        })
        .with_context(|| format!("failed to count rows in {table_name}"))?;
    usize::try_from(count).with_context(|| format!("invalid row count for {table_name}: {count}"))
}

fn read_documents(conn: &Connection, sql: &str) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut documents = Vec::new();
    for (index, row) in rows.enumerate() {
        let raw = row?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("invalid stored document JSON at row {index}"))?;
        match value {
            Value::Object(document) => documents.push(document),
            other => {
                return Err(anyhow!(
                    "stored document at row {index} is not a JSON object: {other}"
                ))
            }
        }
    }
    Ok(documents)
}

/// Parses an import payload: a JSON array of objects, or a single object.
pub fn parse_documents_json(raw: &str) -> Result<Vec<Document>> {
    let value: Value = serde_json::from_str(raw).context("import payload must be valid JSON")?;
    match value {
        Value::Object(document) => Ok(vec![document]),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(document) => Ok(document),
                other => Err(anyhow!(
                    "import payload item {index} must be a JSON object, got {other}"
                )),
            })
            .collect(),
        other => Err(anyhow!(
            "import payload must be a JSON array or object, got {other}"
        )),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use cohort_metrics_core::{build_metrics, MemoryStore, MetricsTable};
    use proptest::prelude::*;
    use serde_json::json;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_metrics<T>(result: Result<T, MetricsError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteCohortStore {
        let store = must(SqliteCohortStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(document) => document,
            other => panic!("fixture must be a JSON object, got {other}"),
        }
    }

    fn seed_worked_example(store: &mut SqliteCohortStore) {
        must(store.import_documents(
            Dataset::Learners,
            &[
                doc(json!({"_id": "A", "recommendation_method": "X", "selected": 0})),
                doc(json!({"_id": "B", "recommendation_method": "X", "selected": 0})),
                doc(json!({"_id": "C", "recommendation_method": "Y", "selected": 1})),
            ],
        ));
        must(store.import_documents(
            Dataset::Logs,
            &[
                doc(json!({"learner_id": "A", "activity_id": "launch"})),
                doc(json!({"learner_id": "A", "activity_id": "launch"})),
                doc(json!({"learner_id": "B", "activity_id": "recommended_item_selected"})),
            ],
        ));
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());

        assert_eq!(must(store.schema_version()), Some(COHORT_MIGRATION_VERSION));
        let registered: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(registered, 1);
    }

    #[test]
    fn import_preserves_document_order_and_fields() {
        let mut store = fixture_store();
        let documents = vec![
            doc(json!({"Outcome ID": "O1", "Assesses": "q1,q2"})),
            doc(json!({"OutcomeID": "O2", "Assesses": "q3", "extra": {"nested": true}})),
        ];

        assert_eq!(must(store.import_documents(Dataset::Outcomes, &documents)), 2);
        assert_eq!(must(store.collection_count(Dataset::Outcomes)), 2);
        assert_eq!(must(store.read_collection(Dataset::Outcomes)), documents);

        assert_eq!(must(store.clear_collection(Dataset::Outcomes)), 2);
        assert!(must(store.read_collection(Dataset::Outcomes)).is_empty());
    }

    #[test]
    fn corrupt_stored_document_surfaces_as_storage_error() {
        let store = fixture_store();
        if let Err(err) = store.connection().execute(
            "INSERT INTO learners(document_json, imported_at) VALUES ('[1,2]', 'now')",
            [],
        ) {
            panic!("test failure: {err}");
        }

        let err = match store.fetch_learners() {
            Ok(_) => panic!("expected corrupt document to fail"),
            Err(err) => err,
        };
        assert!(matches!(
            err,
            MetricsError::Storage {
                operation: "fetch learners",
                ..
            }
        ));
    }

    #[test]
    fn parse_documents_json_accepts_array_or_object() {
        let many = must(parse_documents_json(r#"[{"_id":"A"},{"_id":"B"}]"#));
        assert_eq!(many.len(), 2);

        let single = must(parse_documents_json(r#"{"_id":"A"}"#));
        assert_eq!(single[0]["_id"], json!("A"));

        assert!(parse_documents_json("[1]").is_err());
        assert!(parse_documents_json("42").is_err());
        assert!(parse_documents_json("{").is_err());
    }

    #[test]
    fn build_metrics_persists_both_snapshots() {
        let mut store = fixture_store();
        seed_worked_example(&mut store);

        let table = must_metrics(build_metrics(&mut store));
        assert_eq!(table.len(), 1);

        let raw = must(store.read_snapshot(SnapshotTable::RawLearners));
        assert_eq!(raw.len(), 2);
        assert!(raw.iter().all(|row| row["recommendation_method"] == json!("X")));

        let grouped = must(store.read_snapshot(SnapshotTable::GroupedMetrics));
        let persisted = must_metrics(MetricsTable::from_documents(grouped));
        assert_eq!(persisted, table);

        let info = must(store.snapshot_info(SnapshotTable::GroupedMetrics));
        assert_eq!(info.rows, 1);
        assert!(info.snapshot_id.is_some());
        assert!(info.written_at.is_some());
    }

    #[test]
    fn rebuild_replaces_previous_snapshot_rows() {
        let mut store = fixture_store();
        seed_worked_example(&mut store);

        let _ = must_metrics(build_metrics(&mut store));
        let first = must(store.snapshot_info(SnapshotTable::RawLearners));
        let _ = must_metrics(build_metrics(&mut store));
        let second = must(store.snapshot_info(SnapshotTable::RawLearners));

        assert_eq!(second.rows, 2);
        assert_ne!(first.snapshot_id, second.snapshot_id);

        let distinct_batches: i64 = match store.connection().query_row(
            "SELECT COUNT(DISTINCT snapshot_id) FROM raw_learner_snapshot",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(distinct_batches, 1);
    }

    #[test]
    fn failed_build_leaves_snapshots_untouched() {
        let mut store = fixture_store();
        seed_worked_example(&mut store);
        let _ = must_metrics(build_metrics(&mut store));
        let before = must(store.store_status());

        must(store.clear_collection(Dataset::Logs));
        let err = match build_metrics(&mut store) {
            Ok(_) => panic!("expected empty logs to fail"),
            Err(err) => err,
        };
        assert!(matches!(err, MetricsError::EmptyDataset(Dataset::Logs)));

        let after = must(store.store_status());
        assert_eq!(after.raw_snapshot, before.raw_snapshot);
        assert_eq!(after.grouped_snapshot, before.grouped_snapshot);
        assert_eq!(after.logs, 0);
    }

    #[test]
    fn store_status_reports_counts() {
        let mut store = fixture_store();
        seed_worked_example(&mut store);

        let status = must(store.store_status());
        assert_eq!(status.contract_version, STORE_STATUS_CONTRACT_VERSION);
        assert_eq!(status.learners, 3);
        assert_eq!(status.logs, 3);
        assert_eq!(status.outcomes, 0);
        assert_eq!(status.grouped_snapshot.rows, 0);
        assert!(status.grouped_snapshot.snapshot_id.is_none());
    }

    fn arbitrary_records() -> impl Strategy<Value = (Vec<Document>, Vec<Document>, Vec<Document>)> {
        let learners = prop::collection::vec((0_u8..3, prop::bool::weighted(0.25)), 1..10);
        let logs = prop::collection::vec((0_usize..12, 0_u8..4, prop::option::of(0_u8..4)), 1..40);
        (learners, logs).prop_map(|(learners, logs)| {
            let learner_docs = learners
                .iter()
                .enumerate()
                .map(|(index, (label, selected))| {
                    doc(json!({
                        "_id": format!("L{index}"),
                        "recommendation_method": format!("method-{label}"),
                        "selected": i64::from(*selected),
                    }))
                })
                .collect();
            let log_docs = logs
                .iter()
                .map(|(learner_index, activity, value)| {
                    let activity_id = match activity {
                        0 => "launch".to_string(),
                        1 => "recommended_item_selected".to_string(),
                        other => format!("q{other}"),
                    };
                    let mut document = doc(json!({
                        "learner_id": format!("L{learner_index}"),
                        "activity_id": activity_id,
                    }));
                    if let Some(value) = value {
                        document.insert("value".to_string(), json!(value.to_string()));
                    }
                    document
                })
                .collect();
            let outcome_docs = vec![
                doc(json!({"Outcome ID": "O1", "Assesses": "q2, q3"})),
                doc(json!({"Outcome_ID": "O2", "Assesses": "q3"})),
            ];
            (learner_docs, log_docs, outcome_docs)
        })
    }

    proptest! {
        #[test]
        fn sqlite_build_matches_in_memory_build((learners, logs, outcomes) in arbitrary_records()) {
            let mut sqlite = fixture_store();
            must(sqlite.import_documents(Dataset::Learners, &learners));
            must(sqlite.import_documents(Dataset::Logs, &logs));
            must(sqlite.import_documents(Dataset::Outcomes, &outcomes));
            let mut memory = MemoryStore::new(learners, logs, outcomes);

            let from_sqlite = must_metrics(build_metrics(&mut sqlite));
            let from_memory = must_metrics(build_metrics(&mut memory));
            prop_assert_eq!(&from_sqlite, &from_memory);

            let persisted = must(sqlite.read_snapshot(SnapshotTable::RawLearners));
            prop_assert_eq!(persisted.as_slice(), memory.snapshot(SnapshotTable::RawLearners));
        }
    }
}
