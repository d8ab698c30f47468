//! CHEKT Bridge
//!
//! Main entry point for the bridge service.

use chekt_bridge::{
    alarm_parser::ParserRegistry,
    alarm_pipeline::AlarmPipeline,
    backend::{BackendStore, SupabaseRealtime, SupabaseStore},
    command_session::CommandService,
    discovery::WsDiscovery,
    inventory::{CameraDirectory, CameraInventory, StoreInventory},
    recording_fleet::RecordingFleet,
    registration::{BridgeRegistration, RetryPolicy},
    smtp_server::{SmtpLimits, SmtpServer},
    BridgeConfig, Error,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chekt_bridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CHEKT Bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = BridgeConfig::from_env()?;
    tracing::info!(
        bridge_uuid = %config.bridge_uuid,
        smtp_addr = %config.smtp_addr(),
        export_dir = %config.export_dir.display(),
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(&shutdown);

    let store: Arc<dyn BackendStore> = Arc::new(SupabaseStore::new(&config.supabase_url, &config.supabase_key)?);

    // Registration
    let policy = RetryPolicy {
        initial: config.registration_retry,
        max: config.registration_max_retry,
        max_attempts: None,
    };
    let registration = BridgeRegistration::new(store.clone(), config.bridge_uuid.clone(), policy);
    let identity = match registration.register(&shutdown).await {
        Ok(identity) => identity,
        Err(Error::Cancelled) => {
            tracing::info!("Shutdown requested before registration completed");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    // Cameras and recorders
    let cameras = StoreInventory::new(store.clone())
        .load_cameras(identity.bridge_id)
        .await?;
    let directory = Arc::new(CameraDirectory::new(cameras.clone()));
    let fleet = Arc::new(RecordingFleet::new(cameras, &config.recorder, &shutdown));
    let running = fleet.start_all().await;
    tracing::info!(cameras = fleet.len(), running = running, "Recorders started");

    // Alarm pipeline
    let (events_tx, events_rx) = AlarmPipeline::channel();
    let pipeline = Arc::new(AlarmPipeline::new(
        identity.clone(),
        ParserRegistry::with_defaults(),
        directory,
        fleet.clone(),
        store.clone(),
    ));

    let mut tasks: JoinSet<chekt_bridge::Result<()>> = JoinSet::new();

    {
        let pipeline = pipeline.clone();
        let cancel = shutdown.clone();
        tasks.spawn(async move {
            pipeline.run(events_rx, cancel).await;
            Ok(())
        });
    }

    // SMTP intake
    {
        let server = SmtpServer::new(config.smtp_addr(), SmtpLimits::default(), events_tx);
        let cancel = shutdown.clone();
        tasks.spawn(async move { server.run(cancel).await });
    }

    // Realtime commands
    {
        let transport = Arc::new(SupabaseRealtime::new(
            &config.supabase_url,
            &config.supabase_key,
            shutdown.clone(),
        ));
        let service = Arc::new(CommandService::new(
            identity.bridge_id,
            transport,
            store.clone(),
            Arc::new(WsDiscovery::default()),
            fleet.clone(),
            config.export_dir.clone(),
        ));
        let cancel = shutdown.clone();
        tasks.spawn(async move { service.run(cancel).await });
    }

    tracing::info!(
        bridge_id = identity.bridge_id,
        site_id = identity.site_id,
        "Bridge running"
    );

    // A failed service takes the bridge down
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Service failed, shutting down");
                shutdown.cancel();
            }
            Err(e) => {
                tracing::error!(error = %e, "Service panicked, shutting down");
                shutdown.cancel();
            }
        }
    }

    fleet.stop_all().await;
    tracing::info!("CHEKT Bridge stopped");
    Ok(())
}

fn spawn_signal_handlers(shutdown: &CancellationToken) {
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                token.cancel();
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        }
    });

    #[cfg(unix)]
    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM signal");
                    token.cancel();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }
}
