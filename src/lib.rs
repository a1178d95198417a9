pub mod capture;
pub mod error;
pub mod session;
pub mod settings;
pub mod transport;
pub mod utils;
pub mod workout;

use std::path::PathBuf;

use anyhow::Context;

use capture::CaptureKind;
use session::SessionOrchestrator;
use settings::{EngineSettings, SettingsStore};
use workout::RunStatus;

pub use error::{SessionError, SessionResult};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "pulsefit";

const SETTINGS_ENV: &str = "PULSEFIT_SETTINGS";

fn load_settings() -> anyhow::Result<EngineSettings> {
    match std::env::var_os(SETTINGS_ENV) {
        Some(path) => {
            let store = SettingsStore::new(PathBuf::from(path))?;
            Ok(store.get())
        }
        None => Ok(EngineSettings::default()),
    }
}

/// Scripted demo: join the session, go live on camera, run the routine and
/// print every snapshot as one JSON line until the routine completes or
/// Ctrl-C.
pub fn run() -> anyhow::Result<()> {
    utils::init_logging();
    log_info!("PulseFit session engine starting up...");

    let settings = load_settings()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async move {
        let (engine, _media) = SessionOrchestrator::simulated(settings);
        let mut updates = engine.subscribe();

        engine.connect_transport().await?;
        if let Err(err) = engine.start_capture(CaptureKind::Camera, None).await {
            log_warn!("continuing without camera: {err}");
        }
        engine.start_workout().await?;
        engine.send_chat("Ready when you are!").await?;

        loop {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = updates.borrow_and_update().clone();
                    println!("{}", serde_json::to_string(&snapshot)?);
                    if snapshot.workout_run.status == RunStatus::Completed {
                        log_info!("routine complete");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    log_info!("interrupted");
                    break;
                }
            }
        }

        engine.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}
