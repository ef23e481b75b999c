//! Command surface for the cohort metrics pipeline.
//!
//! Hosts can embed the same behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteCohortStore`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cohort_metrics_core::{
    build_metrics, Dataset, Document, MetricRow, MetricsTable, SnapshotTable,
};
use cohort_metrics_store_sqlite::{
    parse_documents_json, SnapshotInfo, SqliteCohortStore, StoreStatus,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const METRICS_CONTRACT_VERSION: &str = "cohort_metrics.v1";
const RAW_SNAPSHOT_CONTRACT_VERSION: &str = "raw_snapshot.v1";
const IMPORT_CONTRACT_VERSION: &str = "import_report.v1";

#[derive(Debug, Parser)]
#[command(name = "cohort")]
#[command(about = "Cohort learning-analytics metrics")]
pub struct Cli {
    #[arg(
        long,
        env = "COHORT_METRICS_DB",
        default_value = "./cohort_metrics.sqlite3",
        global = true
    )]
    db: PathBuf,

    /// Verbose logging (ignored when RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Whether the selected command asked for JSON output.
    #[must_use]
    pub fn wants_json(&self) -> bool {
        self.command.wants_json()
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load a JSON dataset into the store
    Import(ImportArgs),
    /// Compute or display grouped metrics
    Metrics {
        #[command(subcommand)]
        command: MetricsCommand,
    },
    /// Inspect persisted snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    /// Show collection counts and snapshot state
    Status(OutputArgs),
}

impl Command {
    fn wants_json(&self) -> bool {
        match self {
            Self::Import(args) => args.json,
            Self::Metrics { command } => match command {
                MetricsCommand::Compute(args) | MetricsCommand::Show(args) => args.json,
            },
            Self::Snapshot { command } => match command {
                SnapshotCommand::Raw(args) => args.json,
            },
            Self::Status(args) => args.json,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum MetricsCommand {
    /// Recompute metrics from the stored datasets and refresh both snapshots
    Compute(OutputArgs),
    /// Print the last grouped snapshot without recomputing
    Show(OutputArgs),
}

#[derive(Debug, Subcommand)]
pub enum SnapshotCommand {
    /// Print the raw learner snapshot written by the last computation
    Raw(OutputArgs),
}

#[derive(Debug, Args)]
pub struct OutputArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    dataset: DatasetArg,
    /// JSON file holding an array of objects (or a single object)
    #[arg(long)]
    file: PathBuf,
    /// Clear the collection before importing
    #[arg(long)]
    replace: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DatasetArg {
    Learners,
    Logs,
    Outcomes,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct MetricsPayload {
    contract_version: String,
    snapshot_id: Option<String>,
    written_at: Option<String>,
    rows: Vec<MetricRow>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct RawSnapshotPayload {
    contract_version: String,
    snapshot_id: Option<String>,
    written_at: Option<String>,
    learners: Vec<Document>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    contract_version: String,
    dataset: Dataset,
    removed: usize,
    imported: usize,
    total: usize,
}

/// Installs the stderr log subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Error body printed for `--json` invocations that fail.
#[must_use]
pub fn error_payload(err: &anyhow::Error) -> serde_json::Value {
    serde_json::json!({ "error": format!("{err:#}") })
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or when the
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, cli.command)
}

/// Executes a command against the `SQLite` database at `db_path`.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<()> {
    let mut store = SqliteCohortStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store)
}

/// Executes a command against an existing store handle.
///
/// # Errors
/// Returns an error when import parsing, metric computation, or snapshot
/// reads fail.
pub fn run_command(command: Command, store: &mut SqliteCohortStore) -> Result<()> {
    match command {
        Command::Import(args) => {
            let report = import_file(store, &args)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "dataset={} removed={} imported={} total={}",
                    report.dataset, report.removed, report.imported, report.total
                );
            }
            Ok(())
        }
        Command::Metrics { command } => run_metrics(command, store),
        Command::Snapshot { command } => run_snapshot(command, store),
        Command::Status(args) => {
            let status = store.store_status()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_store_status(&status);
            }
            Ok(())
        }
    }
}

fn run_metrics(command: MetricsCommand, store: &mut SqliteCohortStore) -> Result<()> {
    let (table, json) = match command {
        MetricsCommand::Compute(args) => {
            let table = build_metrics(store).context("metrics computation failed")?;
            (table, args.json)
        }
        MetricsCommand::Show(args) => {
            let documents = store.read_snapshot(SnapshotTable::GroupedMetrics)?;
            (MetricsTable::from_documents(documents)?, args.json)
        }
    };

    let info = store.snapshot_info(SnapshotTable::GroupedMetrics)?;
    if json {
        let payload = build_metrics_payload(table, &info);
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_metrics_table(&table, &info);
    }
    Ok(())
}

fn run_snapshot(command: SnapshotCommand, store: &SqliteCohortStore) -> Result<()> {
    match command {
        SnapshotCommand::Raw(args) => {
            let learners = store.read_snapshot(SnapshotTable::RawLearners)?;
            let info = store.snapshot_info(SnapshotTable::RawLearners)?;
            if args.json {
                let payload = RawSnapshotPayload {
                    contract_version: RAW_SNAPSHOT_CONTRACT_VERSION.to_string(),
                    snapshot_id: info.snapshot_id,
                    written_at: info.written_at,
                    learners,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_snapshot_header(&info);
                for learner in &learners {
                    println!("{}", serde_json::to_string(learner)?);
                }
            }
            Ok(())
        }
    }
}

fn import_file(store: &mut SqliteCohortStore, args: &ImportArgs) -> Result<ImportReport> {
    let dataset = map_dataset(args.dataset);
    let raw = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read import file {}", args.file.display()))?;
    let documents = parse_documents_json(&raw)
        .with_context(|| format!("invalid import file {}", args.file.display()))?;

    let removed = if args.replace {
        store.clear_collection(dataset)?
    } else {
        0
    };
    let imported = store.import_documents(dataset, &documents)?;
    let total = store.collection_count(dataset)?;
    info!(dataset = %dataset, removed, imported, total, "import finished");

    Ok(ImportReport {
        contract_version: IMPORT_CONTRACT_VERSION.to_string(),
        dataset,
        removed,
        imported,
        total,
    })
}

fn map_dataset(value: DatasetArg) -> Dataset {
    match value {
        DatasetArg::Learners => Dataset::Learners,
        DatasetArg::Logs => Dataset::Logs,
        DatasetArg::Outcomes => Dataset::Outcomes,
    }
}

fn build_metrics_payload(table: MetricsTable, info: &SnapshotInfo) -> MetricsPayload {
    MetricsPayload {
        contract_version: METRICS_CONTRACT_VERSION.to_string(),
        snapshot_id: info.snapshot_id.clone(),
        written_at: info.written_at.clone(),
        rows: table.into_rows(),
    }
}

fn print_snapshot_header(info: &SnapshotInfo) {
    println!(
        "table={} rows={} snapshot_id={} written_at={}",
        info.table,
        info.rows,
        info.snapshot_id.as_deref().unwrap_or("n/a"),
        info.written_at.as_deref().unwrap_or("n/a")
    );
}

fn print_metrics_table(table: &MetricsTable, info: &SnapshotInfo) {
    print_snapshot_header(info);
    println!(
        "{:<28} {:>10} {:>12} {:>12} {:>10} {:>12} {:>10}",
        "recommendation_method",
        "group_size",
        "retention",
        "engagement",
        "ctr_clicks",
        "mastery_rate",
        "CTR"
    );
    println!("{}", "-".repeat(100));

    for row in table.rows() {
        println!(
            "{:<28} {:>10} {:>12.6} {:>12.6} {:>10} {:>12.6} {:>10.6}",
            row.treatment_label,
            row.group_size,
            row.retention,
            row.engagement,
            row.ctr_clicks,
            row.mastery_rate,
            row.ctr
        );
    }
}

fn print_store_status(status: &StoreStatus) {
    println!(
        "contract={} schema_version={} learners={} logs={} outcomes={}",
        status.contract_version,
        status
            .schema_version
            .map_or_else(|| "none".to_string(), |value| value.to_string()),
        status.learners,
        status.logs,
        status.outcomes
    );
    print_snapshot_header(&status.raw_snapshot);
    print_snapshot_header(&status.grouped_snapshot);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines, clippy::float_cmp)]

    use super::*;
    use serde_json::json;
    use std::fs;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_path(prefix: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}.{extension}", Ulid::new()))
    }

    fn write_fixture(prefix: &str, value: &serde_json::Value) -> PathBuf {
        let path = temp_path(prefix, "json");
        must(fs::write(&path, value.to_string()).map_err(Into::into));
        path
    }

    fn execute(db_path: &Path, args: &[&str]) -> Result<()> {
        let mut argv = vec![
            "cohort".to_string(),
            "--db".to_string(),
            db_path.display().to_string(),
        ];
        argv.extend(args.iter().map(|arg| (*arg).to_string()));
        let cli = Cli::try_parse_from(argv)?;
        run_cli(cli)
    }

    #[test]
    fn wants_json_follows_selected_subcommand() {
        let json_cli = match Cli::try_parse_from(["cohort", "metrics", "compute", "--json"]) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse args: {err}"),
        };
        assert!(json_cli.wants_json());

        let text_cli = match Cli::try_parse_from(["cohort", "-v", "status"]) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse args: {err}"),
        };
        assert!(!text_cli.wants_json());
        assert!(text_cli.verbose());
    }

    #[test]
    fn import_rejects_unknown_dataset() {
        let parsed = Cli::try_parse_from(["cohort", "import", "courses", "--file", "x.json"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn metrics_payload_contract_is_stable_v1() {
        let table = MetricsTable::from_rows(vec![MetricRow::from_aggregates(
            "X".to_string(),
            2,
            2.0,
            1.5,
            1,
            0.0,
        )]);
        let info = SnapshotInfo {
            table: SnapshotTable::GroupedMetrics,
            rows: 1,
            snapshot_id: Some("01J0SQQP7M70P6Y3R4T8D8G8M2".to_string()),
            written_at: Some("2026-02-07T12:00:00Z".to_string()),
        };

        let value = must(
            serde_json::to_value(build_metrics_payload(table, &info)).map_err(Into::into),
        );
        assert_eq!(
            value,
            json!({
                "contract_version": "cohort_metrics.v1",
                "snapshot_id": "01J0SQQP7M70P6Y3R4T8D8G8M2",
                "written_at": "2026-02-07T12:00:00Z",
                "rows": [
                    {
                        "recommendation_method": "X",
                        "group_size": 2,
                        "retention": 2.0,
                        "engagement": 1.5,
                        "ctr_clicks": 1,
                        "mastery_rate": 0.0,
                        "CTR": 0.5
                    }
                ]
            })
        );
    }

    #[test]
    fn error_payload_carries_full_chain() {
        let err = anyhow::anyhow!("learners dataset is empty").context("metrics computation failed");
        assert_eq!(
            error_payload(&err),
            json!({"error": "metrics computation failed: learners dataset is empty"})
        );
    }

    #[test]
    fn embed_api_import_compute_and_show() {
        let db_path = temp_path("cohort-embed", "sqlite3");
        let learners = write_fixture(
            "cohort-embed-learners",
            &json!([
                {"_id": "A", "recommendation_method": "X", "selected": 0},
                {"_id": "B", "recommendation_method": "X", "selected": 0},
                {"_id": "C", "recommendation_method": "Y", "selected": 1}
            ]),
        );
        let logs = write_fixture(
            "cohort-embed-logs",
            &json!([
                {"learner_id": "A", "activity_id": "launch"},
                {"learner_id": "A", "activity_id": "launch"},
                {"learner_id": "B", "activity_id": "recommended_item_selected"}
            ]),
        );

        must(execute(&db_path, &["import", "learners", "--file", &learners.display().to_string()]));
        must(execute(&db_path, &["import", "logs", "--file", &logs.display().to_string()]));
        // Importing again with --replace must not duplicate rows.
        must(execute(
            &db_path,
            &["import", "logs", "--file", &logs.display().to_string(), "--replace"],
        ));

        must(run_with_db(
            &db_path,
            Command::Metrics {
                command: MetricsCommand::Compute(OutputArgs { json: true }),
            },
        ));

        let mut store = must(SqliteCohortStore::open(&db_path));
        must(store.migrate());
        assert_eq!(must(store.collection_count(Dataset::Logs)), 3);

        let grouped = must(store.read_snapshot(SnapshotTable::GroupedMetrics));
        let table = must(MetricsTable::from_documents(grouped).map_err(Into::into));
        let row = match table.row("X") {
            Some(value) => value.clone(),
            None => panic!("expected a row for label X"),
        };
        assert_eq!(row.group_size, 2);
        assert_eq!(row.ctr, 0.5);
        assert!(table.row("Y").is_none());

        must(run_command(
            Command::Metrics {
                command: MetricsCommand::Show(OutputArgs { json: false }),
            },
            &mut store,
        ));
        must(run_command(
            Command::Snapshot {
                command: SnapshotCommand::Raw(OutputArgs { json: true }),
            },
            &mut store,
        ));
        must(run_command(Command::Status(OutputArgs { json: false }), &mut store));

        let _ = fs::remove_file(&db_path);
        let _ = fs::remove_file(&learners);
        let _ = fs::remove_file(&logs);
    }

    #[test]
    fn compute_on_empty_store_reports_empty_dataset() {
        let db_path = temp_path("cohort-empty", "sqlite3");
        let err = match execute(&db_path, &["metrics", "compute"]) {
            Ok(()) => panic!("expected compute on empty store to fail"),
            Err(err) => err,
        };
        assert_eq!(
            format!("{err:#}"),
            "metrics computation failed: learners dataset is empty"
        );

        let _ = fs::remove_file(&db_path);
    }
}
