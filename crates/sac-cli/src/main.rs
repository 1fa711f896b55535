use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use sac_core::{
    analyze, build_with_bound, filter_raw_tests, filter_tests, find_by_code, parse_query_terms,
    rank, BuildOutcome, Catalog, RawPackageRecord, RawTestRecord, MAX_SPIRAL_OFFSET,
};
use sac_sync::{plan_consolidation, plan_upload, RemoteIndex, UploadSac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV_VAR: &str = "SAC_LOG";

#[derive(Debug, Parser)]
#[command(name = "sac")]
#[command(about = "SAC package lookup and administration CLI")]
struct Cli {
    #[arg(long, default_value = "./sac_snapshot.json")]
    snapshot: PathBuf,

    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Lookup(LookupArgs),
    Search(SearchArgs),
    Build(BuildArgs),
    Duplicates,
    Tests(TestsArgs),
    Sync {
        #[command(subcommand)]
        command: Box<SyncCommand>,
    },
    Consolidate {
        #[command(subcommand)]
        command: Box<ConsolidateCommand>,
    },
}

#[derive(Debug, Args)]
struct LookupArgs {
    #[arg(long)]
    code: String,
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// Comma separated test terms, e.g. "lead, copper, nitrate".
    #[arg(long)]
    terms: String,
}

#[derive(Debug, Args)]
struct BuildArgs {
    #[arg(long = "test")]
    tests: Vec<String>,
    /// Farthest distance from the base number the code search may go.
    #[arg(long, default_value_t = MAX_SPIRAL_OFFSET)]
    max_offset: u64,
}

#[derive(Debug, Args)]
struct TestsArgs {
    #[arg(long, default_value = "")]
    filter: String,
    /// List raw store records (matching name or test_id) instead of collapsed tests.
    #[arg(long, default_value_t = false)]
    raw: bool,
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    Plan(SyncPlanArgs),
}

#[derive(Debug, Args)]
struct SyncPlanArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long)]
    remote: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum ConsolidateCommand {
    Plan(ConsolidatePlanArgs),
}

#[derive(Debug, Args)]
struct ConsolidatePlanArgs {
    #[arg(long)]
    old: String,
    #[arg(long)]
    new: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SnapshotFile {
    #[serde(default)]
    tests: Vec<RawTestRecord>,
    #[serde(default)]
    sacs: Vec<RawPackageRecord>,
}

struct LoadedSnapshot {
    raw: SnapshotFile,
    catalog: Catalog,
    snapshot_id: String,
}

fn with_contract_version(mut value: Value) -> Value {
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "contract_version".to_string(),
            Value::String(CLI_CONTRACT_VERSION.to_string()),
        );
    }
    value
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_env(LOG_ENV_VAR) {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid --log-level value `{level}`"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to initialize logging: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Command::Lookup(args) => run_lookup(&args, &load_snapshot(&cli.snapshot)?),
        Command::Search(args) => run_search(&args, &load_snapshot(&cli.snapshot)?),
        Command::Build(args) => run_build(&args, &load_snapshot(&cli.snapshot)?),
        Command::Duplicates => run_duplicates(&load_snapshot(&cli.snapshot)?),
        Command::Tests(args) => run_tests(&args, &load_snapshot(&cli.snapshot)?),
        Command::Sync { command } => match *command {
            SyncCommand::Plan(args) => run_sync_plan(&args),
        },
        Command::Consolidate { command } => match *command {
            ConsolidateCommand::Plan(args) => {
                run_consolidate_plan(&args, &load_snapshot(&cli.snapshot)?)
            }
        },
    }
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read file {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse JSON file {}", path.display()))
}

fn load_snapshot(path: &Path) -> Result<LoadedSnapshot> {
    let raw: SnapshotFile = read_json_file(path)?;
    let catalog = Catalog::from_raw(&raw.tests, &raw.sacs);
    let snapshot_id = compute_snapshot_id(&catalog);
    tracing::info!(
        path = %path.display(),
        tests = catalog.tests.len(),
        packages = catalog.packages.len(),
        snapshot_id = %snapshot_id,
        "loaded snapshot"
    );
    Ok(LoadedSnapshot { raw, catalog, snapshot_id })
}

fn compute_snapshot_id(catalog: &Catalog) -> String {
    let mut hasher = Sha256::new();
    for package in &catalog.packages {
        hasher.update(package.code.as_bytes());
        for test_name in &package.test_names {
            hasher.update([0x1f]);
            hasher.update(test_name.as_bytes());
        }
        hasher.update([0x1e]);
    }
    for test in &catalog.tests {
        hasher.update(test.name.as_bytes());
        hasher.update([0x1e]);
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("snap_{}", &digest_hex[..16])
}

fn run_lookup(args: &LookupArgs, snapshot: &LoadedSnapshot) -> Result<()> {
    let outcome = find_by_code(&snapshot.catalog.packages, &args.code);
    emit_json(serde_json::json!({
        "snapshot_id": snapshot.snapshot_id,
        "query": args.code,
        "outcome": outcome
    }))
}

fn run_search(args: &SearchArgs, snapshot: &LoadedSnapshot) -> Result<()> {
    let terms = parse_query_terms(&args.terms);
    let outcome = rank(&snapshot.catalog.packages, &terms);
    emit_json(serde_json::json!({
        "snapshot_id": snapshot.snapshot_id,
        "terms": terms,
        "outcome": outcome
    }))
}

fn run_build(args: &BuildArgs, snapshot: &LoadedSnapshot) -> Result<()> {
    let outcome = build_with_bound(&snapshot.catalog.packages, &args.tests, args.max_offset)
        .context("failed to allocate a package code")?;
    let warning = match &outcome {
        BuildOutcome::Built(result) => result.similar_package.as_ref().map(|similar| {
            serde_json::json!({
                "headline": similar.headline(),
                "message": similar.warning(),
                "percent": similar.percent()
            })
        }),
        BuildOutcome::NothingSelected => None,
    };
    emit_json(serde_json::json!({
        "snapshot_id": snapshot.snapshot_id,
        "outcome": outcome,
        "warning": warning
    }))
}

fn run_duplicates(snapshot: &LoadedSnapshot) -> Result<()> {
    let report = analyze(&snapshot.catalog.packages);
    emit_json(serde_json::json!({
        "snapshot_id": snapshot.snapshot_id,
        "package_count": snapshot.catalog.packages.len(),
        "clean": report.is_clean(),
        "report": report
    }))
}

fn run_tests(args: &TestsArgs, snapshot: &LoadedSnapshot) -> Result<()> {
    let tests = if args.raw {
        serde_json::to_value(filter_raw_tests(&snapshot.raw.tests, &args.filter))
            .context("failed to serialize raw tests")?
    } else {
        serde_json::to_value(filter_tests(&snapshot.catalog.tests, &args.filter))
            .context("failed to serialize tests")?
    };
    emit_json(serde_json::json!({
        "snapshot_id": snapshot.snapshot_id,
        "filter": args.filter,
        "raw": args.raw,
        "tests": tests
    }))
}

fn run_sync_plan(args: &SyncPlanArgs) -> Result<()> {
    let upload: Vec<UploadSac> = read_json_file(&args.input)?;
    let remote: RemoteIndex = match &args.remote {
        Some(path) => read_json_file(path)?,
        None => RemoteIndex::default(),
    };
    let plan = plan_upload(&upload, &remote);
    emit_json(serde_json::json!({
        "in_file": args.input,
        "summary": plan.summary(),
        "plan": plan
    }))
}

fn find_raw_test<'a>(records: &'a [RawTestRecord], record_id: &str) -> Result<&'a RawTestRecord> {
    records
        .iter()
        .find(|record| record.record_id == record_id)
        .ok_or_else(|| anyhow!("unknown test record id: {record_id}"))
}

fn run_consolidate_plan(args: &ConsolidatePlanArgs, snapshot: &LoadedSnapshot) -> Result<()> {
    let plan = plan_consolidation(&snapshot.raw.sacs, &args.old, &args.new)?;
    let old_test = find_raw_test(&snapshot.raw.tests, &args.old)?;
    let new_test = find_raw_test(&snapshot.raw.tests, &args.new)?;
    if plan.is_noop() {
        tracing::info!(old = %args.old, "no SACs contain the old test, nothing to do");
    }
    emit_json(serde_json::json!({
        "snapshot_id": snapshot.snapshot_id,
        "old_test": old_test,
        "new_test": new_test,
        "noop": plan.is_noop(),
        "plan": plan
    }))
}
