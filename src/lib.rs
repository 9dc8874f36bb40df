pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod sync;
pub mod utils;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

pub use config::AppConfig;
pub use error::{Error, Result};
pub use events::CallEvent;
pub use media::{MediaConstraints, MediaDevices, SyntheticDevices, TrackKind};
pub use peer::{CallState, CallStatus, CallSummary, Negotiator, NegotiatorConfig};
pub use session::Session;
pub use signaling::{MemorySignalChannel, SignalChannel};
pub use store::{EntityKind, LocalStore};
pub use sync::{MemoryRemote, PendingChange, SyncCoordinator, SyncOutcome, SyncState};

/// Environment variable naming a JSON config file
pub const CONFIG_ENV: &str = "NABHA_CONFIG";

const CALL_TIMEOUT: Duration = Duration::from_secs(20);
const CALL_HOLD: Duration = Duration::from_secs(2);

/// Demo entry point: an offline sync round followed by a loopback call
/// between a doctor and a patient on this machine.
pub fn run() -> Result<()> {
    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => AppConfig::load(PathBuf::from(path))?,
        None => AppConfig::default(),
    };
    logger::init(&config.log_filter);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::config(format!("failed to start runtime: {e}")))?;

    runtime.block_on(async move {
        sync_demo(&config).await?;
        let (doctor, patient) = call_demo(&config).await?;
        info!(
            doctor_connected_for = ?doctor.connected_for,
            patient_connected_for = ?patient.connected_for,
            "loopback call finished"
        );
        Ok(())
    })
}

async fn sync_demo(config: &AppConfig) -> Result<()> {
    let store = Arc::new(LocalStore::open(&config.storage_path).await?);
    let remote = Arc::new(MemoryRemote::new());
    let sync = Arc::new(SyncCoordinator::open(Arc::clone(&store), remote).await?);

    let (online_tx, online_rx) = watch::channel(false);
    let connectivity = tokio::spawn({
        let sync = Arc::clone(&sync);
        async move { sync.run_connectivity(online_rx).await }
    });

    sync.enqueue(PendingChange::create(
        EntityKind::HealthRecords,
        utils::random_id(),
        json!({ "bp": "120/80", "pulse": 72 }),
    ))
    .await?;
    sync.enqueue(PendingChange::create(
        EntityKind::Appointments,
        utils::random_id(),
        json!({ "doctor": "doctor-demo", "slot": "10:30" }),
    ))
    .await?;
    info!(pending = sync.state().pending_count, "queued changes while offline");

    let mut state = sync.subscribe();
    online_tx.send_replace(true);
    let synced = state
        .wait_for(|s| s.pending_count == 0 && s.last_sync_at.is_some())
        .await
        .map(|s| s.clone())
        .map_err(|_| Error::sync("sync coordinator stopped"))?;
    info!(last_sync_at = ?synced.last_sync_at, "pending changes synced");

    drop(online_tx);
    if let Err(e) = connectivity.await {
        warn!(error = %e, "connectivity task ended abnormally");
    }

    drop(sync);
    match Arc::try_unwrap(store) {
        Ok(store) => store.close().await,
        Err(_) => {
            warn!("local store still shared, not closed");
            Ok(())
        }
    }
}

async fn call_demo(config: &AppConfig) -> Result<(CallSummary, CallSummary)> {
    let session = Session::generate("doctor-demo", "patient-demo")?;
    let channel = Arc::new(MemorySignalChannel::new());
    let factory = peer::RtcTransportFactory::new(config);

    let mut doctor = Negotiator::new(
        session.clone(),
        &session.doctor_id,
        Arc::clone(&channel),
        factory.clone(),
        SyntheticDevices::new(),
        NegotiatorConfig::from(config),
    )?;
    let mut patient = Negotiator::new(
        session.clone(),
        &session.patient_id,
        channel,
        factory,
        SyntheticDevices::new(),
        NegotiatorConfig::from(config),
    )?;

    patient.join()?;
    doctor.start_call().await?;

    let doctor_task = tokio::spawn(async move { hold_call(&mut doctor).await });
    let patient_task = tokio::spawn(async move { hold_call(&mut patient).await });

    let doctor = doctor_task
        .await
        .map_err(|e| Error::negotiation(format!("doctor task failed: {e}")))??;
    let patient = patient_task
        .await
        .map_err(|e| Error::negotiation(format!("patient task failed: {e}")))??;
    Ok((doctor, patient))
}

/// Drive a call to `Connected`, keep it up briefly, then hang up
async fn hold_call<C, F, D>(negotiator: &mut Negotiator<C, F, D>) -> Result<CallSummary>
where
    C: SignalChannel,
    F: peer::TransportFactory,
    D: MediaDevices,
{
    let connected = tokio::time::timeout(CALL_TIMEOUT, negotiator.pump_until(CallState::Connected)).await;

    let outcome = match connected {
        Ok(Ok(())) => {
            info!(participant = %negotiator.local_id(), "call connected");
            // keep trickling candidates for a moment
            let _ = tokio::time::timeout(CALL_HOLD, async {
                while negotiator.pump().await.is_ok() {}
            })
            .await;
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::connectivity(format!(
            "not connected within {CALL_TIMEOUT:?}"
        ))),
    };

    let summary = negotiator.end_call().await;
    outcome.map(|()| summary)
}
