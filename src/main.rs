//! Poll a Portainer server and check container images for upstream updates

use env_logger::Env;
use log::{error, info};

use portwatch::cli::configure_cli;
use portwatch::config::load_config;
use portwatch::coordinator::{Coordinator, Features};
use portwatch::notifications::{setup_dispatcher, start_notification_handler};
use portwatch::portainer::PortainerClient;
use portwatch::updates::UpdateService;

use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + 'static>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = configure_cli();
    let config = load_config(&args.config);

    let (tx_events, rx_events) = mpsc::channel(32);
    let dispatcher = setup_dispatcher(config.dispatcher.as_ref());
    tokio::spawn(async move {
        start_notification_handler(rx_events, dispatcher).await;
    });

    info!("Starting portwatch");
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
        info!("Received shutdown signal, gracefully shutting down...");
        process::exit(0);
    })
    .expect("Error setting Ctrl-C handler");

    let api = PortainerClient::new(
        &config.portainer.host,
        &config.portainer.api_key,
        config.portainer.ssl,
        config.portainer.verify_ssl,
    )?;
    if let Err(e) = api.connection_test().await {
        error!("unable to reach Portainer at {}: {e}", config.portainer.host);
    }

    let features = Features {
        health_check: config.features.health_check,
        restart_policy: config.features.restart_policy,
        update_check: config.features.update_check,
    };
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let updates = UpdateService::new(
        http,
        features.update_check,
        config.update_check_time(),
        config.ghcr_token(),
    );
    let coordinator = Arc::new(Coordinator::new(api, features, updates, Some(tx_events)));

    #[cfg(unix)]
    {
        // a force check can be requested at runtime with SIGUSR1
        use tokio::signal::unix::{SignalKind, signal};
        let coordinator = coordinator.clone();
        let mut usr1 = signal(SignalKind::user_defined1())?;
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                info!("received SIGUSR1, forcing update check");
                if let Err(e) = coordinator.force_update_check().await {
                    error!("forced update check failed: {e}");
                }
                info!(
                    "next scheduled update check: {}",
                    coordinator.next_update_check().await
                );
            }
        });
    }

    info!(
        "next scheduled update check: {} (last: {})",
        coordinator.next_update_check().await,
        coordinator.last_update_check().await
    );

    let interval = args.interval.unwrap_or(config.schedule.interval);
    loop {
        let now = SystemTime::now();
        if let Err(e) = coordinator.refresh().await {
            error!("refresh failed: {e}");
        }

        if args.once {
            break;
        }
        while running.load(Ordering::SeqCst)
            && now.elapsed().unwrap_or_default() < Duration::from_secs(interval)
        {
            sleep(Duration::from_millis(500)).await;
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
    }
    Ok(())
}
