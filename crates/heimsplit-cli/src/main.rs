//! CLI for heimsplit.
//!
//! Assigns experiment groups against a file-backed cache, and reads back cached
//! values and the status line. Each storage key maps to one JSON file (plus its
//! `:config` companion) in the store directory.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use heimsplit_cache::overrides::{
    apply_overrides, force_flag_from_query, parse_force_flag, resolve_overrides,
};
use heimsplit_cache::{format_status, AssignOptions, AssignmentCache, FileStore, DEFAULT_STORAGE_KEY};
use heimsplit_core::{AssignmentResult, ExperimentMap, KeyValueStore, Observer, Strategy, UNASSIGNED};
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding one JSON file per storage key
    #[arg(long, global = true, env = "HEIMSPLIT_STORE_DIR", default_value = "data/heimsplit")]
    store_dir: PathBuf,

    /// Storage key isolating independent caches
    #[arg(long, global = true, env = "HEIMSPLIT_STORAGE_KEY", default_value = DEFAULT_STORAGE_KEY)]
    storage_key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assign groups, keeping cached assignments whose split is unchanged
    Assign(AssignArgs),
    /// Clear the cache, then assign every experiment afresh
    Reset(AssignArgs),
    /// Print the cached group of one experiment (-1 if none)
    Value {
        /// Experiment name as used in the definitions file
        name: String,
    },
    /// Print the status line ("<key>-<group>;...")
    Status,
    /// Remove the cached assignments
    Clear,
}

#[derive(Args)]
struct AssignArgs {
    /// JSON file with the experiment definitions
    #[arg(long)]
    definitions: PathBuf,

    /// User identifier, required by the crc32 strategy
    #[arg(long, env = "HEIMSPLIT_USER_ID")]
    user_id: Option<String>,

    /// Default strategy for experiments that declare none
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Forced groups ("1001-1;1002-0") or a URL carrying forceHitTestFlag
    #[arg(long)]
    force_flag: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    Random,
    Crc32,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Random => Strategy::Uniform,
            StrategyArg::Crc32 => Strategy::DeterministicHash,
        }
    }
}

#[derive(Serialize, Debug)]
struct AssignmentRecord {
    ts: String,
    storage_key: String,
    result: AssignmentResult,
    status: String,
}

fn iso8601_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_definitions(path: &Path) -> Result<ExperimentMap> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open definitions file {}", path.display()))?;
    let definitions: ExperimentMap = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Invalid definitions in {}", path.display()))?;

    for (name, definition) in &definitions {
        definition
            .validate(name)
            .with_context(|| format!("Invalid experiment '{}' in {}", name, path.display()))?;
    }

    Ok(definitions)
}

/// Accepts either a bare flag value or a URL/query string carrying it.
fn force_flag_value(raw: &str) -> Option<String> {
    if raw.contains('?') || raw.contains('=') {
        force_flag_from_query(raw)
    } else {
        Some(raw.to_string()).filter(|value| !value.is_empty())
    }
}

fn run_assign<S: KeyValueStore, O: Observer>(
    cache: &mut AssignmentCache<S, O>,
    storage_key: &str,
    definitions: &ExperimentMap,
    args: &AssignArgs,
    reset: bool,
) -> AssignmentRecord {
    let options = AssignOptions {
        strategy: args.strategy.map(Strategy::from),
        user_id: args.user_id.clone(),
        storage_key: Some(storage_key.to_string()),
    };

    let mut result = if reset {
        cache.reset(definitions, &options)
    } else {
        cache.reconcile(definitions, &options)
    };

    if let Some(flag) = args.force_flag.as_deref().and_then(force_flag_value) {
        let overrides = resolve_overrides(
            definitions
                .iter()
                .map(|(name, def)| (name.as_str(), def.external_key.as_str())),
            &parse_force_flag(&flag),
        );
        tracing::info!(forced = overrides.len(), "applying forced groups");
        apply_overrides(&mut result, &overrides);
    }

    let status = format_status(definitions.iter().map(|(name, def)| {
        (
            def.external_key.as_str(),
            result.get(name).copied().unwrap_or(UNASSIGNED),
        )
    }));

    AssignmentRecord {
        ts: iso8601_now(),
        storage_key: storage_key.to_string(),
        result,
        status,
    }
}

fn print_record(record: &AssignmentRecord) -> Result<()> {
    serde_json::to_writer_pretty(std::io::stdout(), record)?;
    println!();
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut cache = AssignmentCache::new(FileStore::new(&cli.store_dir));

    match cli.command {
        Commands::Assign(args) => {
            let definitions = load_definitions(&args.definitions)?;
            let record = run_assign(&mut cache, &cli.storage_key, &definitions, &args, false);
            print_record(&record)?;
        }
        Commands::Reset(args) => {
            let definitions = load_definitions(&args.definitions)?;
            let record = run_assign(&mut cache, &cli.storage_key, &definitions, &args, true);
            print_record(&record)?;
        }
        Commands::Value { name } => {
            println!("{}", cache.get_value(&name, &cli.storage_key));
        }
        Commands::Status => {
            println!("{}", cache.status_string(&cli.storage_key));
        }
        Commands::Clear => {
            cache.clear_cache(&cli.storage_key);
            println!("Cleared cache '{}' in {}", cli.storage_key, cli.store_dir.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use heimsplit_core::{MemoryStore, RecordingObserver};

    fn args(force_flag: Option<&str>) -> AssignArgs {
        AssignArgs {
            definitions: PathBuf::from("unused.json"),
            user_id: Some("123456789".to_string()),
            strategy: Some(StrategyArg::Crc32),
            force_flag: force_flag.map(str::to_string),
        }
    }

    fn definitions() -> ExperimentMap {
        serde_json::from_str(
            r#"{
                "hero": { "key": "1001", "groups": { "0": 50, "1": 50 } },
                "cta": { "key": "1002", "groups": { "0": 100 }, "strategy": "random" }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_force_flag_value() {
        assert_eq!(force_flag_value("1001-1").as_deref(), Some("1001-1"));
        assert_eq!(
            force_flag_value("https://x.example/?forceHitTestFlag=1001-0").as_deref(),
            Some("1001-0")
        );
        assert_eq!(force_flag_value(""), None);
        assert_eq!(force_flag_value("https://x.example/?a=b"), None);
    }

    #[test]
    fn test_run_assign_uses_batch_strategy_and_status() {
        let mut cache = AssignmentCache::with_observer(MemoryStore::new(), RecordingObserver::new());
        let record = run_assign(&mut cache, "k", &definitions(), &args(None), false);

        // crc32("123456789") % 100 == 62 -> second half of a 50/50 split
        assert_eq!(record.result["hero"], 1);
        assert_eq!(record.result["cta"], 0);
        assert_eq!(record.status, "1001-1;1002-0");
        assert_eq!(cache.status_string("k"), "1001-1;1002-0");
        assert!(cache.observer().is_empty());
    }

    #[test]
    fn test_run_assign_applies_force_flag_without_persisting_it() {
        let mut cache = AssignmentCache::with_observer(MemoryStore::new(), RecordingObserver::new());
        let record = run_assign(&mut cache, "k", &definitions(), &args(Some("1001-0")), false);

        assert_eq!(record.result["hero"], 0);
        assert_eq!(record.status, "1001-0;1002-0");
        assert_eq!(cache.get_value("hero", "k"), 1);
    }

    #[test]
    fn test_load_definitions_rejects_empty_groups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("defs.json");
        std::fs::write(&path, r#"{ "hero": { "key": "1001", "groups": {} } }"#).unwrap();

        let err = load_definitions(&path).unwrap_err();
        assert!(format!("{err:#}").contains("declares no groups"));
    }

    #[test]
    fn test_load_definitions_missing_file() {
        let err = load_definitions(Path::new("/nonexistent/heimsplit/defs.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to open definitions file"));
    }

    #[test]
    fn test_cli_parses_global_args_after_subcommand() {
        let cli = Cli::try_parse_from([
            "heimsplit",
            "value",
            "hero",
            "--store-dir",
            "/tmp/x",
            "--storage-key",
            "k",
        ])
        .unwrap();
        assert_eq!(cli.store_dir, PathBuf::from("/tmp/x"));
        assert_eq!(cli.storage_key, "k");
        assert!(matches!(cli.command, Commands::Value { ref name } if name == "hero"));
    }
}
