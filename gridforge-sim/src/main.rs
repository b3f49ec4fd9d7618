use anyhow::Result;
use clap::Parser;
use gridforge_core::ClockMode;
use gridforge_sim::{demo_plant, Orchestrator};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "gridforge",
    version,
    about = "Gridforge — deterministic ICS simulation range"
)]
struct Cli {
    /// Bind address for all protocol listeners
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port base; Modbus lands on base+502, DNP3 on base+10000, etc.
    /// 0 binds every listener to an ephemeral port.
    #[arg(long, default_value_t = 10000)]
    port_base: u16,

    /// Clock mode: realtime, accelerated, or paused
    #[arg(long, default_value = "realtime")]
    mode: String,

    /// Time acceleration multiplier (accelerated mode)
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Log level: trace, debug, info, warn, error
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print the summary snapshot as JSON on exit
    #[arg(long)]
    summary: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Gridforge v{}", env!("CARGO_PKG_VERSION"));

    let (mut config, parts) = demo_plant(&cli.host, cli.port_base);
    config.simulation.clock_mode = match cli.mode.as_str() {
        "accelerated" => ClockMode::Accelerated,
        "paused" => ClockMode::Paused,
        _ => ClockMode::RealTime,
    };
    config.simulation.speed = cli.speed;

    let mut orchestrator = Orchestrator::boot(config, parts)
        .await
        .map_err(|e| anyhow::anyhow!("boot failed: {e}"))?;

    for line in orchestrator.summary()["listeners"]
        .as_array()
        .into_iter()
        .flatten()
    {
        info!(
            device = line["device"].as_str().unwrap_or(""),
            protocol = line["protocol"].as_str().unwrap_or(""),
            addr = line["addr"].as_str().unwrap_or("unbound"),
            "Service exposed"
        );
    }
    info!("Plant is live; ctrl-c to shut down");

    orchestrator
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    info!("Signal received, draining");
    orchestrator.shutdown().await;

    if cli.summary {
        println!("{}", serde_json::to_string_pretty(&orchestrator.summary())?);
    }
    Ok(())
}
