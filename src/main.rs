use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

use barrage::cli::config::Config;
use barrage::engine::{Engine, RunPlan};

#[derive(Parser)]
#[command(name = "barrage")]
#[command(about = "Load-generation and assertion harness for JSON-RPC services", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario config against the target
    Run {
        /// Path to the scenario config (YAML or JSON)
        scenario: PathBuf,
        #[arg(short, long, alias = "vus")]
        workers: Option<usize>,
        #[arg(short, long)]
        duration: Option<String>,
        /// Arrivals per time unit (constant-arrival-rate)
        #[arg(short, long)]
        rate: Option<u64>,
        /// Target base URL (overrides config and BASE_URL)
        #[arg(long)]
        base_url: Option<String>,
        /// Print the report as JSON instead of the human summary
        #[arg(long)]
        json: bool,
        /// Also write the JSON report to a file
        #[arg(long)]
        export_json: Option<PathBuf>,
    },
    /// Validate a scenario config without running it
    Validate {
        /// Path to the scenario config
        scenario: PathBuf,
    },
    /// Write a starter scenario config
    Init {
        /// Output file path (default: barrage.yaml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the JSON schema of the scenario config
    Schema {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Load a .env file if present: the scenario's directory first, then the
/// working directory. Existing environment variables are never clobbered.
fn load_dotenv(scenario: &std::path::Path) {
    let script_dir = scenario.parent().unwrap_or(std::path::Path::new("."));
    let env_paths = [script_dir.join(".env"), PathBuf::from(".env")];
    for env_path in &env_paths {
        if env_path.exists() {
            if let Ok(contents) = std::fs::read_to_string(env_path) {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((key, value)) = line.split_once('=') {
                        let key = key.trim();
                        let value = value.trim().trim_matches('"').trim_matches('\'');
                        if std::env::var(key).is_err() {
                            std::env::set_var(key, value);
                        }
                    }
                }
            }
            break;
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            scenario,
            workers,
            duration,
            rate,
            base_url,
            json,
            export_json,
        } => {
            load_dotenv(&scenario);

            let mut config = Config::load(&scenario)?;
            config.apply_env();

            // CLI flags win over env and file. The schedule flags only
            // affect the single-scenario shorthand.
            if config.scenarios.is_some()
                && (workers.is_some() || duration.is_some() || rate.is_some())
            {
                tracing::warn!(
                    "--workers/--duration/--rate are ignored when the config defines scenarios"
                );
            }
            if let Some(w) = workers {
                config.workers = Some(w);
            }
            if let Some(d) = duration {
                config.duration = Some(d);
            }
            if let Some(r) = rate {
                config.rate = Some(r);
            }
            if let Some(url) = base_url {
                config.base_url = Some(url);
            }

            let plan = RunPlan::from_config(&config)?;
            let engine = Engine::new()?;
            let report = engine.run_load_test(plan, json, export_json)?;

            if !report.passed() {
                let failed: Vec<_> = report
                    .thresholds
                    .iter()
                    .filter(|t| !t.passed)
                    .map(|t| format!("{} {}", t.metric, t.expr))
                    .collect();
                eprintln!("Thresholds failed: {}", failed.join(", "));
                std::process::exit(1);
            }
        }
        Commands::Validate { scenario } => {
            barrage::cli::validate::run_validate(&scenario)?;
        }
        Commands::Init { output } => {
            barrage::cli::init::run_init(output.as_deref())?;
        }
        Commands::Schema { output } => {
            let schema = schemars::schema_for!(Config);
            let schema_json = serde_json::to_string_pretty(&schema)?;
            match output {
                Some(path) => std::fs::write(path, schema_json)?,
                None => println!("{}", schema_json),
            }
        }
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "barrage", &mut std::io::stdout());
        }
    }

    Ok(())
}
