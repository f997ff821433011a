use crate::assets::{DEFAULT_FEED_SERVER_PORT, LOOPBACK_HOST};
use crate::config::{Config, app_name, app_version};
use crate::manager::Manager;
use crate::manager::workers::WorkerDirectory;
use crate::mind::{ComponentMind, LocalMind};
use crate::planet::{ComponentConfig, Planet};
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use futures_util::future::join_all;
use log::{error, info, warn};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::{panic, process};

pub mod assets;
pub mod config;
pub mod error;
pub mod manager;
pub mod mind;
pub mod planet;
pub mod utils;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(app_version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Manager configuration (JSON).")
                .required(false)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("planet")
                .short('p')
                .long("planet")
                .value_name("FILE")
                .help("Planet to load components from, and to save them to on exit.")
                .required(false)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("local")
                .short('l')
                .long("local")
                .help("Run every component of the planet as an in-process job.")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // invoke the default handler and exit the process
        orig_hook(panic_info);
        process::exit(105);
    }));

    let config_path = matches.get_one::<PathBuf>("config").cloned();
    let planet_path = matches.get_one::<PathBuf>("planet").cloned();
    let local = matches.get_flag("local");

    if let Err(e) = run(config_path, planet_path, local).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(config_path: Option<PathBuf>, planet_path: Option<PathBuf>, local: bool) -> Result<()> {
    let mut config = match config_path {
        Some(path) => Config::load(&path)?,
        None => Config::new(),
    };
    if planet_path.is_some() {
        config.planet = planet_path;
    }

    let planet = match &config.planet {
        Some(path) if path.exists() => Planet::load(path)?,
        _ => Planet::new(),
    };
    let host = config
        .host
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| LOOPBACK_HOST.to_string());
    info!(
        "{} {} managing {} components from {}",
        app_name(),
        app_version(),
        planet.len(),
        host
    );

    // gracefully close the manager when receiving SIGINT, SIGTERM, or SIGHUP
    let stop = SignalOfStop::new();
    let on_signal = stop.clone();
    ctrlc::set_handler(move || on_signal.cancel()).context("Error setting Ctrl-C handler")?;

    let components: Vec<ComponentConfig> = if local {
        planet.records().map(|record| record.config()).collect()
    } else {
        Vec::new()
    };

    let sos = SignalOfStop::new();
    let manager = Manager::spawn(planet, WorkerDirectory::from_config(&config.workers), &sos);
    if local {
        start_local(&manager, components, &config, &host).await?;
    }

    stop.wait_cancellation().await;
    info!("Shutting down");

    let planet = manager.shutdown().await?;
    sos.cancel();
    if config.save_on_exit {
        if let Some(path) = &config.planet {
            planet.save(path)?;
        }
    }
    Ok(())
}

/// Start every component as an in-process job and announce the feed servers
/// of the workers they run on
async fn start_local(
    manager: &Manager,
    components: Vec<ComponentConfig>,
    config: &Config,
    host: &str,
) -> Result<()> {
    let default_worker = config
        .workers
        .first()
        .map(|w| w.name.clone())
        .unwrap_or_else(|| "localhost".to_string());

    let mut used_workers = BTreeSet::new();
    let logins = components.into_iter().map(|component| {
        let worker = component
            .worker
            .clone()
            .unwrap_or_else(|| default_worker.clone());
        used_workers.insert(worker.clone());
        let avatar_id = component.avatar_id();
        let mind: Arc<dyn ComponentMind> = Arc::new(LocalMind::new(component, &worker).with_host(host));
        async move {
            let result = manager.login(&avatar_id, mind, host).await;
            (avatar_id, result)
        }
    });
    let logins: Vec<_> = logins.collect();

    for (avatar_id, result) in join_all(logins).await {
        match result {
            Ok(wiring) => info!("{} started in-process ({} feed decisions)", avatar_id, wiring.len()),
            Err(e) => warn!("Could not start {}: {}", avatar_id, e),
        }
    }

    for worker in used_workers {
        let known = config
            .workers
            .iter()
            .any(|w| w.name == worker && w.feed_server_port.is_some());
        if !known {
            let wiring = manager.worker_attached(&worker, DEFAULT_FEED_SERVER_PORT).await?;
            info!("Worker {} attached, {} feed decisions", worker, wiring.len());
        }
    }
    Ok(())
}
