use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bridgetest::engine::client::DroneClient;
use bridgetest::engine::server::EngineServer;
use bridgetest::engine::sim::SimEngine;
use bridgetest::engine::Engine;
use bridgetest::scenario::{Scenario, ScenarioReport};
use bridgetest::{Traffic, TrafficConfig};

#[derive(Parser)]
#[command(
    name = "bridgetest",
    about = "Synthetic traffic generation and stream accounting for Ethernet bridge tests",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $BRIDGETEST_CONFIG, then /etc/bridgetest/bridgetest.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the ports offered by the packet-generation engine
    Ports {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Execute a scenario file and print per-interface packet counts
    Run {
        /// Scenario TOML file
        #[arg(long)]
        scenario: PathBuf,

        /// Use the in-process simulated engine instead of connecting to one
        #[arg(long)]
        simulate: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Serve a simulated engine over the control protocol
    ServeSim {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:7878")]
        bind: String,

        /// Port names, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        ports: Vec<String>,

        /// Bridge membership as comma-separated port names; repeat per bridge
        #[arg(long = "bridge")]
        bridges: Vec<String>,
    },
}

fn init_tracing(config: &TrafficConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TrafficConfig::load(path)?,
        None => TrafficConfig::load_or_default(),
    };
    init_tracing(&config);

    match cli.command {
        Commands::Ports { json } => {
            let mut client = DroneClient::connect(config.engine.address.as_str())
                .await
                .with_context(|| format!("cannot reach engine at {}", config.engine.address))?;
            let ports = client.port_configs().await?;
            client.close().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ports)?);
            } else {
                println!("{:<6} | {:<16} | Description", "Port", "Name");
                println!("{:-<6}-|-{:-<16}-|-{:-<30}", "", "", "");
                for p in &ports {
                    println!("{:<6} | {:<16} | {}", p.id, p.name, p.description);
                }
            }
        }
        Commands::Run {
            scenario,
            simulate,
            json,
        } => {
            let scenario = Scenario::load(&scenario)?;
            tracing::info!(test_id = %scenario.test_id, simulate, "running scenario");
            let report = if simulate {
                let mut engine = SimEngine::new(&scenario.interfaces);
                if !scenario.bridges.is_empty() {
                    engine = engine.with_bridges(&scenario.bridges)?;
                }
                run_scenario(engine, &config, scenario).await?
            } else {
                let engine = DroneClient::connect(config.engine.address.as_str())
                    .await
                    .with_context(|| format!("cannot reach engine at {}", config.engine.address))?;
                run_scenario(engine, &config, scenario).await?
            };
            print_report(&report, json)?;
        }
        Commands::ServeSim {
            bind,
            ports,
            bridges,
        } => {
            let mut engine = SimEngine::new(&ports);
            if !bridges.is_empty() {
                let groups: Vec<Vec<&str>> = bridges
                    .iter()
                    .map(|b| b.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
                    .collect();
                engine = engine.with_bridges(&groups)?;
            }
            tracing::info!(%bind, ports = ports.len(), "starting simulated engine");
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("failed to bind {}", bind))?;
            EngineServer::new(engine).run(listener).await?;
        }
    }

    Ok(())
}

async fn run_scenario<E: Engine + 'static>(
    engine: E,
    config: &TrafficConfig,
    scenario: Scenario,
) -> Result<ScenarioReport> {
    let report = Traffic::session(engine, config, |traffic| {
        Box::pin(async move { scenario.execute(traffic).await })
    })
    .await?;
    Ok(report)
}

fn print_report(report: &ScenarioReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("\nScenario {}", report.test_id);
    for step in &report.steps {
        println!("\n[{}]", step.step_id);
        println!("{:<16} | {:>10} | {:>10}", "Interface", "TX pkts", "RX pkts");
        println!("{:-<16}-|-{:->10}-|-{:->10}", "", "", "");
        for (name, stats) in &step.interfaces {
            println!("{:<16} | {:>10} | {:>10}", name, stats.tx_pkts, stats.rx_pkts);
        }
    }
    Ok(())
}
