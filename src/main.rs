//! vigil CLI - parallel test runner with dependency-driven watch mode.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vigil::config::{self, Config, PoolName};
use vigil::environment::classify_spec;
use vigil::orchestrator::{CancelReason, Orchestrator, OrchestratorError, RunOptions, Shard};
use vigil::pool::PoolSettings;
use vigil::project::{build_projects, build_set};
use vigil::report::{ConsoleReporter, MultiReporter};
use vigil::watch::WatchLoop;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Parallel test runner with dependency-driven watch mode", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "vigil.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests once
    Run(RunArgs),

    /// Run tests, then rerun affected files on every change
    Watch(RunArgs),

    /// List discovered test files
    List {
        /// Path substrings a test file must contain
        filters: Vec<String>,

        /// Only list files of these projects
        #[arg(long = "project")]
        projects: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[derive(Args)]
struct RunArgs {
    /// Path substrings a test file must contain
    filters: Vec<String>,

    /// Override the default pool
    #[arg(long)]
    pool: Option<PoolName>,

    /// Override maximum concurrent workers per pool
    #[arg(long)]
    max_workers: Option<usize>,

    /// Cancel the run after this many failed tests
    #[arg(long)]
    bail: Option<usize>,

    /// Exit successfully when no test files are found
    #[arg(long)]
    pass_with_no_tests: bool,

    /// Only run these projects
    #[arg(long = "project")]
    projects: Vec<String>,

    /// Only run tests whose name matches this pattern
    #[arg(short = 't', long)]
    test_name_pattern: Option<String>,

    /// Only run these files (comma separated)
    #[arg(long, value_delimiter = ',')]
    changed: Option<Vec<PathBuf>>,

    /// Run one shard of the suite, e.g. 2/4
    #[arg(long)]
    shard: Option<Shard>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => run_tests(&cli.config, args, false, cli.verbose).await,
        Commands::Watch(args) => run_tests(&cli.config, args, true, cli.verbose).await,
        Commands::List {
            filters,
            projects,
            format,
        } => list_tests(&cli.config, &filters, &projects, &format).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(),
    }
}

/// Loads the configuration and resolves the workspace root against the
/// directory holding the configuration file.
fn load(config_path: &Path) -> Result<(Config, PathBuf)> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let config_dir = match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let root = config_dir.join(&config.vigil.root);
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve workspace root {}", root.display()))?;
    Ok((config, root))
}

async fn run_tests(config_path: &Path, args: RunArgs, watch: bool, verbose: bool) -> Result<()> {
    let (mut config, root) = load(config_path)?;

    // Apply overrides
    if let Some(pool) = args.pool {
        config.vigil.pool = pool;
    }
    if let Some(max_workers) = args.max_workers {
        config.vigil.max_workers = Some(max_workers);
    }
    if let Some(bail) = args.bail {
        config.vigil.bail = bail;
    }
    if args.pass_with_no_tests {
        config.vigil.pass_with_no_tests = true;
    }

    info!("Loaded configuration from {}", config_path.display());

    let cwd = std::env::current_dir()?;
    let options = RunOptions {
        watch,
        filters: args.filters.clone(),
        project_filter: args.projects,
        test_name_pattern: args.test_name_pattern,
        changed: args
            .changed
            .map(|files| files.into_iter().map(|f| cwd.join(f)).collect()),
        shard: args.shard,
    };

    let reporter = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));
    let orchestrator = Arc::new(Orchestrator::new(config, root, options, Arc::new(reporter))?);
    orchestrator.init().await;

    let interrupt = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if orchestrator.phase() == vigil::orchestrator::RunPhase::Idle {
                    break;
                }
                orchestrator.cancel(CancelReason::KeyboardInput).await;
            }
        })
    };

    let summary = match orchestrator.start(&args.filters).await {
        Ok(summary) => summary,
        Err(OrchestratorError::NoTests { exit_code }) => {
            eprintln!("No test files found");
            orchestrator.close().await;
            std::process::exit(exit_code);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            orchestrator.close().await;
            std::process::exit(1);
        }
    };

    if !watch {
        interrupt.abort();
        orchestrator.close().await;
        std::process::exit(summary.exit_code());
    }

    let watch_loop = WatchLoop::new(Arc::clone(&orchestrator))?;
    tokio::select! {
        result = watch_loop.run() => {
            if let Err(e) = result {
                warn!("Watch loop stopped: {}", e);
            }
        }
        _ = interrupt => {}
    }

    orchestrator.close().await;
    Ok(())
}

async fn list_tests(config_path: &Path, filters: &[String], projects: &[String], format: &str) -> Result<()> {
    let (config, root) = load(config_path)?;
    let options = RunOptions {
        project_filter: projects.to_vec(),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(
        config,
        root.clone(),
        options,
        Arc::new(vigil::report::NullReporter),
    )?;
    let specs = orchestrator.collect_specs(filters).await?;

    let mut entries = Vec::with_capacity(specs.len());
    for spec in &specs {
        let environment = match classify_spec(spec).await {
            Ok(classified) => classified.environment.name,
            Err(e) => format!("<{}>", e),
        };
        let relative = spec.path.strip_prefix(&root).unwrap_or(&spec.path);
        entries.push(serde_json::json!({
            "project": spec.project_name(),
            "path": relative,
            "environment": environment,
            "pool": spec.project.pool_for(&spec.path).to_string(),
        }));
    }

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&entries)?;
            println!("{}", json);
        }
        _ => {
            println!("Discovered {} test files:", entries.len());
            for entry in &entries {
                let project = entry["project"].as_str().unwrap_or_default();
                let prefix = if project.is_empty() {
                    String::new()
                } else {
                    format!("[{}] ", project)
                };
                println!(
                    "  {}{} ({}, {})",
                    prefix,
                    entry["path"].as_str().unwrap_or_default(),
                    entry["environment"].as_str().unwrap_or_default(),
                    entry["pool"].as_str().unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    build_projects(config.resolved_projects(), Path::new("."), &config.vigil.pool)?;
    PoolSettings::from_config(&config.vigil, false)?;
    build_set("watch.force_rerun_triggers", &config.watch.force_rerun_triggers)?;
    build_set("watch.ignore", &config.watch.ignore)?;
    for pattern in &config.watch.trigger_patterns {
        build_set("watch.trigger_patterns", std::slice::from_ref(&pattern.glob))?;
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = check_config(&config) {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Default pool: {}", config.vigil.pool);
    match config.vigil.max_workers {
        Some(max) => println!("  Max workers: {}", max),
        None => println!("  Max workers: auto"),
    }
    println!("  Bail: {}", config.vigil.bail);
    println!("  Cache: {}", if config.cache.enabled { "enabled" } else { "disabled" });

    let projects = config.resolved_projects();
    println!("  Projects: {}", projects.len());
    for project in &projects {
        let name = if project.name.is_empty() { "<default>" } else { project.name.as_str() };
        let pool = project.pool.as_ref().unwrap_or(&config.vigil.pool);
        println!("    {} (environment: {}, pool: {})", name, project.environment, pool);
    }

    Ok(())
}

const STARTER_CONFIG: &str = r#"# vigil configuration file

[vigil]
pool = "forks"
bail = 0
pass_with_no_tests = false

[[projects]]
name = "unit"
include = ["**/*.{test,spec}.{js,mjs,cjs,ts,mts,cts,jsx,tsx}"]
environment = "node"

[pools.forks]
# Worker speaking the JSON-lines protocol on stdin/stdout
command = "node ./node_modules/.bin/vigil-worker"

[watch]
debounce_ms = 100

[cache]
dir = ".vigil"
"#;

fn init_config() -> Result<()> {
    let path = PathBuf::from("vigil.toml");
    if path.exists() {
        eprintln!("vigil.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, STARTER_CONFIG)?;
    println!("Created vigil.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  vigil run");

    Ok(())
}
