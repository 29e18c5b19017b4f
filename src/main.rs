//! hpcrun CLI
//!
//! Entry point for the `hpcrun` command-line tool.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use hpcrun::backend::SystemRunner;
use hpcrun::config::{ConfigError, EffectiveConfig};
use hpcrun::job::TestFileError;
use hpcrun::registry::{ExecutorOverrides, RegistryError};
use hpcrun::signal::SignalHandler;
use hpcrun::store::query::{self, parse_format, FormatField};
use hpcrun::store::{resolve, Filter, QueryError, ReportQuery, ResolveError, Selection};
use hpcrun::{ExecutorRegistry, RunError, RunOptions, Runner, Store, StoreError, TestFile};

#[derive(Parser)]
#[command(name = "hpcrun")]
#[command(about = "Run tests on local shells, batch schedulers and containers", version)]
struct Cli {
    /// Site config file, merged over ~/.config/hpcrun/config.toml
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Store root (overrides the configured `root`)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a file of resolved tests as one build
    Run {
        /// TOML file of [[test]] tables
        tests: PathBuf,

        /// Poll interval for every executor, in seconds
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Pending budget for every executor, in seconds
        #[arg(long)]
        max_pend_time: Option<u64>,

        /// Number of concurrent jobs
        #[arg(long, short = 'j')]
        pool_size: Option<usize>,

        /// Print the build summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List configured executors
    Executors {
        #[arg(long)]
        json: bool,
    },

    /// Query recorded test results
    Report {
        /// Comma-separated key=value filters, e.g. `name=hello,state=COMPLETED`
        #[arg(long)]
        filter: Option<String>,

        /// Comma-separated fields to print
        #[arg(long)]
        format: Option<String>,

        /// Only the most recent record per test name
        #[arg(long, conflicts_with = "oldest")]
        latest: bool,

        /// Only the earliest record per test name
        #[arg(long)]
        oldest: bool,

        /// Only the N most recent records
        #[arg(long, short = 'n')]
        count: Option<usize>,

        /// Runs, passes and failures per test name
        #[arg(long)]
        breakdown: bool,

        #[arg(long)]
        json: bool,
    },

    /// List builds
    History {
        /// Include builds still IN_PROGRESS
        #[arg(long)]
        all: bool,

        /// Delete the build with this id
        #[arg(long)]
        delete: Option<u64>,

        #[arg(long)]
        json: bool,
    },

    /// Resolve a test name, `name/prefix` or job id to one job
    Resolve {
        ident: String,

        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    TestFile(#[from] TestFileError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Query(#[from] QueryError),

    #[error("{0}")]
    Resolve(#[from] ResolveError),

    #[error("{0}")]
    Run(#[from] RunError),

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match execute(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Layered config plus CLI overrides
fn load_config(cli: &Cli, pool_size: Option<usize>) -> Result<EffectiveConfig, CliError> {
    let mut overrides = serde_json::Map::new();
    if let Some(root) = &cli.root {
        overrides.insert("root".to_string(), json!(root.to_string_lossy()));
    }
    if let Some(pool_size) = pool_size {
        overrides.insert("pool_size".to_string(), json!(pool_size));
    }
    let overrides = (!overrides.is_empty()).then_some(Value::Object(overrides));

    let host = EffectiveConfig::default_host_path();
    let config = EffectiveConfig::build(host.as_deref(), cli.config.as_deref(), overrides)?;
    debug!(sources = config.sources.len(), "configuration loaded");
    Ok(config)
}

fn open_store(config: &EffectiveConfig) -> Result<Store, CliError> {
    Ok(Store::open(config.settings()?.root)?)
}

fn execute(cli: Cli) -> Result<i32, CliError> {
    match &cli.command {
        Commands::Run {
            tests,
            poll_interval,
            max_pend_time,
            pool_size,
            json,
        } => {
            let config = load_config(&cli, *pool_size)?;
            let overrides = ExecutorOverrides {
                poll_interval_seconds: *poll_interval,
                max_pending_seconds: *max_pend_time,
            };
            run_tests(&config, tests, overrides, *json)
        }
        Commands::Executors { json } => {
            let config = load_config(&cli, None)?;
            list_executors(&config, *json)
        }
        Commands::Report {
            filter,
            format,
            latest,
            oldest,
            count,
            breakdown,
            json,
        } => {
            let store = open_store(&load_config(&cli, None)?)?;
            let selection = if *latest {
                Selection::Latest
            } else if *oldest {
                Selection::Oldest
            } else {
                Selection::All
            };
            let query = ReportQuery {
                filter: filter.as_deref().map(Filter::parse).transpose()?.unwrap_or_default(),
                selection,
                count: *count,
            };
            report(&store, &query, format.as_deref(), *breakdown, *json)
        }
        Commands::History { all, delete, json } => {
            let store = open_store(&load_config(&cli, None)?)?;
            if let Some(id) = delete {
                store.delete_build(*id)?;
                println!("Deleted build {}", id);
                return Ok(0);
            }
            history(&store, *all, *json)
        }
        Commands::Resolve { ident, json } => {
            let store = open_store(&load_config(&cli, None)?)?;
            let records = store.reports()?;
            let job = resolve(&records, ident)?;
            if *json {
                println!("{}", job.to_json()?);
            } else {
                println!("{}", job.test_root_path.display());
            }
            Ok(0)
        }
        Commands::Config => {
            let config = load_config(&cli, None)?;
            println!("{}", config.to_json()?);
            Ok(0)
        }
    }
}

fn run_tests(
    config: &EffectiveConfig,
    tests: &Path,
    overrides: ExecutorOverrides,
    json: bool,
) -> Result<i32, CliError> {
    let settings = config.settings()?;
    let registry = ExecutorRegistry::from_value(&config.executors(), overrides)?;
    let file = TestFile::load(tests)?;
    let store = Store::open(&settings.root)?;

    let handler = SignalHandler::with_state(Arc::new(
        hpcrun::signal::SignalState::with_grace_period(Duration::from_secs(
            settings.termination_grace_seconds,
        )),
    ));
    handler.install()?;

    let command = std::env::args().collect::<Vec<_>>().join(" ");
    let options = RunOptions {
        command,
        pool_size: settings.pool_size,
        max_poll_errors: settings.max_poll_errors,
    };
    info!(tests = file.tests.len(), root = %settings.root.display(), "starting run");

    let commands = SystemRunner::with_timeout(Duration::from_secs(settings.command_timeout_seconds));
    let runner = Runner::new(store, registry, Arc::new(commands), options)
        .with_signal_state(handler.state());
    let outcome = runner.run(&file.tests)?;

    if json {
        println!("{}", outcome.summary.to_json()?);
    } else {
        for job in &outcome.jobs {
            let verdict = job.verdict.map(|v| v.as_str()).unwrap_or("-");
            println!(
                "{:<24} {:<10} {:<16} {:<5} {}",
                job.test_name,
                job.short_id(),
                job.state.as_str(),
                verdict,
                job.executor_ref
            );
        }
        println!("{}", outcome.summary.human_summary);
        println!("Build log: {}", outcome.build.log_path.display());
    }
    Ok(outcome.exit_code())
}

fn list_executors(config: &EffectiveConfig, json: bool) -> Result<i32, CliError> {
    let registry = ExecutorRegistry::from_value(&config.executors(), ExecutorOverrides::default())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&registry.list())?);
        return Ok(0);
    }
    for executor in registry.list() {
        println!(
            "{:<24} poll {:>5}s  pend {:>7}s  {}",
            executor.reference(),
            executor.poll_interval_seconds,
            executor.max_pending_seconds,
            executor.description.as_deref().unwrap_or("")
        );
    }
    Ok(0)
}

fn report(
    store: &Store,
    query: &ReportQuery,
    format: Option<&str>,
    breakdown: bool,
    json: bool,
) -> Result<i32, CliError> {
    let records = store.reports()?;

    if breakdown {
        let stats = query::breakdown_by_name(&records);
        if json {
            let value: serde_json::Map<String, Value> = stats
                .iter()
                .map(|(name, b)| {
                    (
                        name.clone(),
                        json!({ "runs": b.runs, "pass": b.pass, "fail": b.fail, "incomplete": b.incomplete }),
                    )
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{:<24} {:>6} {:>6} {:>6} {:>10}", "name", "runs", "pass", "fail", "incomplete");
            for (name, b) in &stats {
                println!("{:<24} {:>6} {:>6} {:>6} {:>10}", name, b.runs, b.pass, b.fail, b.incomplete);
            }
        }
        return Ok(0);
    }

    let fields = match format {
        Some(spec) => parse_format(spec)?,
        None => FormatField::DEFAULT.to_vec(),
    };
    let selected = query::select(&records, query);

    if json {
        let rows: Vec<Value> = selected
            .iter()
            .map(|job| {
                Value::Object(
                    fields
                        .iter()
                        .map(|f| (f.as_str().to_string(), Value::String(f.value(job))))
                        .collect(),
                )
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }

    let mut rows: Vec<Vec<String>> = vec![fields.iter().map(|f| f.as_str().to_string()).collect()];
    rows.extend(selected.iter().map(|job| fields.iter().map(|f| f.value(job)).collect()));
    let widths: Vec<usize> = (0..fields.len())
        .map(|i| rows.iter().map(|row| row[i].len()).max().unwrap_or(0))
        .collect();
    for row in rows {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        println!("{}", line.join("  ").trim_end());
    }
    Ok(0)
}

fn history(store: &Store, include_incomplete: bool, json: bool) -> Result<i32, CliError> {
    let builds = store.list_builds(include_incomplete)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&builds)?);
        return Ok(0);
    }
    for build in builds {
        let end = build
            .end_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>5}  {:<12} {:<26} {:<26} {:>4} jobs  {}@{} {}",
            build.build_id,
            build.state.as_str(),
            build.start_time.to_rfc3339(),
            end,
            build.job_ids.len(),
            build.user,
            build.hostname,
            build.command
        );
    }
    Ok(0)
}
