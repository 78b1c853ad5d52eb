//! netx-sim: Tunnel Client Walkthrough
//!
//! Wires the tracker, lease manager and tunnel controller together against
//! the simulated platform and backend, then runs a scripted session.
//!
//! Usage: `netx-sim [settings.toml|settings.json]`

use anyhow::{Context, Result};
use netx_runtime::{ActivityBus, ProcessingTracker, TaskGroup};
use netx_vpn::sim::{SimulatedBackend, SimulatedPlatform};
use netx_vpn::{
    ControllerConfig, JsonFileStore, LeaseGatewayManager, LeaseManagerConfig, MemoryStore,
    NetxSettings, SessionStore, TunnelSessionController, X25519Generator,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let settings = match std::env::args().nth(1) {
        Some(path) => NetxSettings::from_file(Path::new(&path))
            .with_context(|| format!("loading settings from {}", path))?,
        None => NetxSettings::new("simaccount01", "sim-device", "a1b2c3"),
    };
    info!("netx-sim starting (account {})", settings.account_id);

    let store: Arc<dyn SessionStore> = match &settings.store_path {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => Arc::new(MemoryStore::new()),
    };

    let activity = ActivityBus::stream();
    let tracker = ProcessingTracker::new(settings.tracker.into());
    tracker.listen(&activity);
    tracker.start_sweeper();

    let platform = SimulatedPlatform::new();
    let backend = SimulatedBackend::with_default_gateways();

    let leases = LeaseGatewayManager::new(
        LeaseManagerConfig {
            backend_timeout: settings.timing.backend_timeout(),
            alias: Some(settings.device_id.clone()),
            ..LeaseManagerConfig::default()
        },
        backend,
        store.clone(),
        Arc::new(X25519Generator),
        activity.clone(),
    );
    let controller = TunnelSessionController::new(
        ControllerConfig::from_settings(&settings),
        platform,
        leases.clone(),
        store,
        activity,
    );
    controller.start();

    let tasks = TaskGroup::new("netx-sim");
    let mut sessions = controller.subscribe();
    tasks.spawn("session-log", async move {
        while let Some(session) = sessions.recv().await {
            info!(
                "Session: {:?} (attempt {}, vpn {})",
                session.state, session.attempt_id, session.vpn_enabled
            );
        }
    });

    let result = run_session(&controller, &leases, &settings).await;

    if tracker.has_conn_issues() {
        warn!("Connectivity issues: {:?}", tracker.conn_issue_set());
    }
    tasks.shutdown();
    controller.shutdown();
    tracker.shutdown();

    result?;
    info!("netx-sim finished");
    Ok(())
}

async fn run_session(
    controller: &TunnelSessionController,
    leases: &LeaseGatewayManager,
    settings: &NetxSettings,
) -> Result<()> {
    let keypair = controller.on_account_changed(&settings.account_id)?;
    info!("Device key {}", keypair.public_key());

    controller.restore().await?;
    controller.turn_on().await?;

    let until = SystemTime::now() + Duration::from_secs(300);
    let status = controller.change_pause(Some(until)).await?;
    info!("Paused, {}s left", status.pause_seconds);
    let status = controller.change_pause(None).await?;
    info!("Unpaused, {}s left", status.pause_seconds);

    let gateways = leases.load_gateways().await?;
    for gateway in gateways.iter().take(2) {
        controller.select_gateway(gateway.clone()).await?;
        let status = controller.query_status().await?;
        info!("Routing through {} (active: {})", gateway.nice_name(), status.active);
    }

    match controller.request("https://api.example.net/v2/lease", "GET", "").await {
        Ok(reply) => info!("Protected request answered: {}", reply),
        Err(e) => warn!("Protected request failed: {}", e),
    }

    controller.clear_lease().await?;
    info!("Filtering only, state {:?}", controller.state());

    controller.turn_off().await?;
    Ok(())
}
