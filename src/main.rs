use std::process;
use std::sync::Arc;

use clap::{Args, Parser};
use tracing::{error, info};

use labwatch::hypervisor::Hypervisor;
use labwatch::logging;
use labwatch::monitor::alarm::AlarmMonitor;
use labwatch::monitor::pipeline::PipelineMonitor;
use labwatch::monitor::run_monitor;
use labwatch::node::NoAlarmSink;
use labwatch::store::{ConfigStore, MemoryStore};
use labwatch::util::unix_now;

#[derive(Parser)]
#[command(
    name = "labwatch",
    about = "Distributed slow control and alarm system for laboratory experiments"
)]
struct Cli {
    #[command(flatten)]
    role: Role,

    /// Also write DEBUG messages to disk
    #[arg(long)]
    debug: bool,

    /// Experiment name
    #[arg(long, env = "LABWATCH_EXPERIMENT")]
    experiment: String,

    /// Configuration store to use (path to a YAML seed for the in-process
    /// store)
    #[arg(long, env = "LABWATCH_STORE")]
    store: String,

    /// Base directory for log files
    #[arg(long, env = "LABWATCH_LOGBASE", default_value = "/global/logs")]
    logbase: String,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Role {
    /// Start the alarm monitor
    #[arg(long)]
    alarm: bool,

    /// Start the control pipeline monitor
    #[arg(long)]
    control: bool,

    /// Start the convert pipeline monitor
    #[arg(long)]
    convert: bool,

    /// Start the specified device monitor
    #[arg(long, value_name = "NAME")]
    device: Option<String>,

    /// Start the hypervisor
    #[arg(long)]
    hypervisor: bool,

    /// Print a snapshot of the current system status
    #[arg(long)]
    status: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{}", e);
        eprintln!("{}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let seed_path = shellexpand::tilde(&cli.store).to_string();
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::from_yaml_file(&seed_path)?);

    if cli.role.status {
        let snapshot = store.current_status().await?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    if let Some(device) = &cli.role.device {
        // make sure the name at least resolves before pointing elsewhere
        let _ = store.get_device(device).await?;
        anyhow::bail!(
            "device monitors are hosted by the driver plugins, not this binary; \
             ask the hypervisor to `start {}`",
            device
        );
    }

    let name = if cli.role.alarm {
        "pl_alarm"
    } else if cli.role.control {
        "pl_control"
    } else if cli.role.convert {
        "pl_convert"
    } else {
        "hypervisor"
    };
    logging::init(name, &cli.experiment, &cli.logbase, cli.debug, Some(store.clone()))?;
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    info!("Starting {} for experiment {} on {}", name, cli.experiment, host);

    if cli.role.alarm {
        let app = AlarmMonitor::new(&cli.experiment, store.clone()).await?;
        run_monitor(app, &cli.experiment, store).await?;
    } else if cli.role.control || cli.role.convert {
        let flavor = if cli.role.control { "control" } else { "convert" };
        let app = Arc::new(
            PipelineMonitor::new(flavor, &cli.experiment, store.clone(), Arc::new(NoAlarmSink))
                .await?,
        );
        run_monitor(app, &cli.experiment, store).await?;
    } else {
        // refuse to double-start a live hypervisor
        let doc = store.hypervisor_config().await?;
        if doc.status == "online" {
            if let Some(heartbeat) = doc.heartbeat {
                let age = unix_now() - heartbeat.timestamp_micros() as f64 / 1e6;
                if age < 2.0 * doc.period {
                    anyhow::bail!("hypervisor already running (heartbeat {}s ago)", age as i64);
                }
            }
            info!("Hypervisor crashed?");
        }
        let app = Hypervisor::new(&cli.experiment, store.clone(), cli.debug, &cli.logbase);
        run_monitor(app, &cli.experiment, store).await?;
    }

    info!("Shutting down");
    Ok(())
}
