//! # hive-node
//!
//! Runs a coordinator and its configured workers on one in-process channel.
//!
//! - `hive-node run "<objective>"`: decompose, delegate and print the plan status
//! - `hive-node plan "<objective>"`: print the execution plan without running it
//! - `hive-node vote "<proposal>"`: put a proposal to every worker
//! - `hive-node config`: print the effective configuration as TOML

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hive_connector::logging::init_tracing;
use hive_connector::{ConnectorConfig, LocalSwarm};
use hive_protocol::ConsensusType;
use hive_scheduler::{Objective, PlanState};

#[derive(Parser)]
#[command(name = "hive-node")]
#[command(version, about = "Hive agent coordination node", long_about = None)]
struct Cli {
    /// Path to the TOML config (defaults to <config dir>/hive/hive.toml)
    #[arg(short, long, global = true, env = "HIVE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter; takes precedence over `RUST_LOG` and the `[logging]` section
    #[arg(long, global = true, env = "HIVE_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute an objective across the swarm
    Run {
        objective: String,
        /// Decomposition rule set (research, development, analysis, general)
        #[arg(long)]
        category: Option<String>,
    },
    /// Show the execution plan for an objective
    Plan {
        objective: String,
        #[arg(long)]
        category: Option<String>,
    },
    /// Ask every worker to vote on a proposal
    Vote {
        proposal: String,
        #[arg(long, value_enum, default_value_t = Rule::Majority)]
        rule: Rule,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum Rule {
    Unanimous,
    Majority,
    Supermajority,
}

impl From<Rule> for ConsensusType {
    fn from(rule: Rule) -> Self {
        match rule {
            Rule::Unanimous => ConsensusType::Unanimous,
            Rule::Majority => ConsensusType::Majority,
            Rule::Supermajority => ConsensusType::Supermajority,
        }
    }
}

fn objective(description: String, category: Option<String>) -> Objective {
    match category {
        Some(category) => Objective::new(description).with_category(category),
        None => Objective::new(description),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConnectorConfig::load(cli.config.as_deref()).context("loading configuration")?;

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config).context("rendering configuration")?);
        return Ok(());
    }

    init_tracing(&config.logging, cli.log.as_deref())?;
    let swarm = LocalSwarm::start(&config).await.context("starting local swarm")?;

    let result = match cli.command {
        Commands::Run { objective: description, category } => {
            let status = swarm.run_objective(objective(description, category)).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            if status.state == PlanState::Completed && status.failures.is_empty() {
                Ok(())
            } else {
                Err(anyhow::anyhow!("{} task(s) failed", status.failures.len()))
            }
        }
        Commands::Plan { objective: description, category } => {
            let plan = swarm.scheduler().plan(objective(description, category)).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Commands::Vote { proposal, rule, timeout_secs } => {
            let outcome = swarm
                .vote(
                    serde_json::json!({ "proposal": proposal }),
                    rule.into(),
                    Duration::from_secs(timeout_secs),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Commands::Config => Ok(()),
    };

    swarm.shutdown().await;
    result
}
