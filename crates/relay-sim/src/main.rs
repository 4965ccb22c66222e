use anyhow::Context;
use clap::{Parser, Subcommand};
use relay_chain::ExperimentConfig;
use relay_sim::{default_experiment, run_simulator, SimulatorConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay-sim", version, about = "Chain-growth scheduler simulator")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run simulated participants and audit the chains
    Simulate {
        /// Random seed for reproducibility
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Number of participants
        #[arg(long, default_value_t = 50)]
        participants: u64,
        /// Chance that a participant abandons a trial
        #[arg(long, default_value_t = 0.05)]
        abandon: f64,
        /// Chance that a background job fails
        #[arg(long, default_value_t = 0.05)]
        job_failure: f64,
        /// Experiment configuration (.toml, .yaml or .yml)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the supervisor's response timeout, in seconds
        #[arg(long)]
        response_timeout: Option<u64>,
        /// Report only the first violation
        #[arg(long)]
        stop_on_violation: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective experiment configuration as JSON
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

fn load_experiment(path: Option<&PathBuf>) -> anyhow::Result<ExperimentConfig> {
    match path {
        Some(path) => ExperimentConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(default_experiment()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Simulate {
            seed,
            participants,
            abandon,
            job_failure,
            config,
            response_timeout,
            stop_on_violation,
            json,
        } => {
            let mut experiment = load_experiment(config.as_ref())?;
            if let Some(secs) = response_timeout {
                experiment.supervisor.response_timeout = Duration::from_secs(secs);
            }
            let config = SimulatorConfig {
                seed,
                participants,
                abandon_probability: abandon,
                job_failure_probability: job_failure,
                stop_on_first_violation: stop_on_violation,
                experiment,
                ..SimulatorConfig::default()
            };

            let report = run_simulator(config).await?;
            if json {
                println!("{}", report.to_json()?);
            } else {
                println!("{}", report.generate_text());
            }
            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        Command::Config { config } => {
            let experiment = load_experiment(config.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&experiment)?);
        }
    }
    Ok(())
}
