//! KREIOS driver binary
//!
//! Connects to a Prodigy server and runs the acquisition worker. With
//! `--acquire` a single acquisition is run with the settings given on the
//! command line and a status summary is printed; without it the driver
//! stays resident until Ctrl+C and is driven through the library API.
//!
//! Usage:
//!   kreios --host prodigy.lab --port 7010
//!   kreios --config kreios.toml --acquire --start-energy 400 --end-energy 410

use anyhow::Context;
use clap::Parser;
use kreios_rs::acquisition::AcquisitionWorker;
use kreios_rs::client::ProdigyClient;
use kreios_rs::common::state::DriverState;
use kreios_rs::config::DriverConfig;
use kreios_rs::spectrum::{self, RunMode};
use kreios_rs::store::DriverStore;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kreios", about = "SPECS KREIOS-150 driver (Prodigy Remote In)")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short = 'f', long = "config")]
    config_file: Option<String>,

    /// Prodigy server host (overrides config and PRODIGY_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Prodigy server port (overrides config and PRODIGY_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Run one acquisition and exit
    #[arg(long)]
    acquire: bool,

    /// Run mode: FAT, SFAT, FRR, FE or LVS
    #[arg(long, default_value = "FAT")]
    run_mode: String,

    /// Start energy [eV]
    #[arg(long)]
    start_energy: Option<f64>,

    /// End energy [eV]
    #[arg(long)]
    end_energy: Option<f64>,

    /// Step width [eV]
    #[arg(long)]
    step_width: Option<f64>,

    /// Pass energy [eV]
    #[arg(long)]
    pass_energy: Option<f64>,

    /// Dwell time per energy point [s]
    #[arg(long)]
    dwell_time: Option<f64>,

    /// Number of iterations to accumulate
    #[arg(long)]
    iterations: Option<u32>,
}

fn parse_run_mode(token: &str) -> anyhow::Result<RunMode> {
    RunMode::ALL
        .into_iter()
        .find(|m| m.token() == token)
        .with_context(|| format!("unknown run mode {:?} (expected FAT/SFAT/FRR/FE/LVS)", token))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kreios_rs=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config_file {
        Some(path) => DriverConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => DriverConfig::default(),
    };
    config.apply_env()?;
    if let Some(host) = args.host.clone() {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let run_mode = parse_run_mode(&args.run_mode)?;

    info!(address = %config.address(), "Starting KREIOS driver");

    let store = Arc::new(DriverStore::new());
    store.update_settings(|s| {
        s.run_mode = run_mode;
        if let Some(v) = args.start_energy {
            s.start_energy = v;
        }
        if let Some(v) = args.end_energy {
            s.end_energy = v;
        }
        if let Some(v) = args.step_width {
            s.step_width = v;
        }
        if let Some(v) = args.pass_energy {
            s.pass_energy = v;
        }
        if let Some(v) = args.dwell_time {
            s.dwell_time = v;
        }
        if let Some(v) = args.iterations {
            s.iterations = v;
        }
    });

    // connect and enumerate; the server allows exactly one client
    let mut client = ProdigyClient::connect(&config)
        .await
        .context("connecting to Prodigy server")?;
    client
        .load_parameters()
        .await
        .context("enumerating analyzer parameters")?;
    match spectrum::read_domains(&mut client).await {
        Ok(domains) => store.set_domains(domains),
        Err(e) => warn!(error = %e, "Could not enumerate lens modes / scan ranges"),
    }
    store.mark_connected(client.identity().clone(), client.metrics());

    let client = Arc::new(Mutex::new(client));
    let worker = AcquisitionWorker::new(Arc::clone(&client), Arc::clone(&store), config.clone());

    // Ctrl+C aborts any running session first, so the worker settles before
    // the shutdown broadcast reaches it
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let mut shutdown_wait = shutdown_tx.subscribe();
    {
        let shutdown_tx = shutdown_tx.clone();
        let store = Arc::clone(&store);
        let address = config.address();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!(address = %address, "Ctrl+C received, stopping acquisition");
            store.stop_acquisition();
            let _ = shutdown_tx.send(());
        });
    }
    let worker_task = tokio::spawn(worker.run(shutdown_rx));

    if args.acquire {
        run_single_acquisition(&store).await?;
        let _ = shutdown_tx.send(());
    } else {
        println!(
            "KREIOS driver connected to {}. Press Ctrl+C to stop.",
            config.address()
        );
        let _ = shutdown_wait.recv().await;
    }

    worker_task.await.ok();

    // leave the analyzer in its safe state before letting go of the server
    {
        let mut client = client.lock().await;
        if let Err(e) = client.exchange("SetSafeState", &[]).await {
            warn!(error = %e, "SetSafeState failed");
        }
        client.disconnect().await.ok();
    }
    store.mark_disconnected("Driver stopped");

    info!("KREIOS driver stopped");
    Ok(())
}

/// Start one acquisition and wait for it to settle
async fn run_single_acquisition(store: &Arc<DriverStore>) -> anyhow::Result<()> {
    let mut status_rx = store.subscribe_status();
    store.start_acquisition();

    // a clean completion settles back to Idle with 100% progress; failures
    // stay in their terminal state
    let snapshot = status_rx
        .wait_for(|s| {
            s.state.is_terminal()
                || (s.state == DriverState::Idle && s.progress.percent_complete == 100)
        })
        .await
        .context("status channel closed")?
        .clone();

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    let spectrum = store.spectrum();
    info!(
        state = %snapshot.state,
        samples = spectrum.len(),
        "Acquisition ended"
    );
    Ok(())
}
