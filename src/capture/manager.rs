use std::sync::Arc;

use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};
use crate::settings::CaptureSettings;
use crate::{log_debug, log_error, log_info, log_warn};

use super::backend::{DeviceInfo, GrantId, HardwareGrant, MediaBackend};
use super::session::{CaptureKind, CaptureRequest, CaptureSession, EndReason, TrackKind};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "pulsefit::capture";

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// The current session changed (requesting, active, track toggled) or
    /// went away (`None`).
    Changed(Option<CaptureSession>),
    Ended {
        session: CaptureSession,
        reason: EndReason,
    },
    DevicesChanged(Vec<DeviceInfo>),
}

struct ActiveCapture {
    session: CaptureSession,
    grant: GrantId,
    /// Stops the task waiting on the grant's external-end signal.
    watcher: CancellationToken,
}

#[derive(Default)]
struct ManagerState {
    current: Option<ActiveCapture>,
    /// Placeholder shown while a request is in flight, plus its cancel handle.
    pending: Option<(CaptureSession, CancellationToken)>,
    devices: Vec<DeviceInfo>,
    devices_loaded: bool,
    last_camera_device: Option<String>,
}

/// Holds at most one hardware grant at a time.
///
/// Starting a new capture while one is live releases the old grant first and
/// waits a short settle delay before asking for the next one.
#[derive(Clone)]
pub struct CaptureManager {
    backend: Arc<dyn MediaBackend>,
    state: Arc<Mutex<ManagerState>>,
    request_lock: Arc<Mutex<()>>,
    settings: CaptureSettings,
    events: mpsc::UnboundedSender<CaptureEvent>,
    shutdown: CancellationToken,
    device_watcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CaptureManager {
    /// Must be called from within a tokio runtime; the device-change
    /// listener is spawned immediately.
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        settings: CaptureSettings,
    ) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            backend,
            state: Arc::new(Mutex::new(ManagerState::default())),
            request_lock: Arc::new(Mutex::new(())),
            settings,
            events,
            shutdown: CancellationToken::new(),
            device_watcher: Arc::new(Mutex::new(None)),
        };

        let changes = manager.backend.device_changes();
        let handle = tokio::spawn(device_watch_loop(manager.clone(), changes));
        if let Ok(mut guard) = manager.device_watcher.try_lock() {
            *guard = Some(handle);
        }

        (manager, rx)
    }

    pub async fn current(&self) -> Option<CaptureSession> {
        let state = self.state.lock().await;
        state
            .current
            .as_ref()
            .map(|active| active.session.clone())
            .or_else(|| state.pending.as_ref().map(|(session, _)| session.clone()))
    }

    /// Cached device list, loaded on first use and refreshed on every
    /// device-change notification.
    pub async fn list_devices(&self) -> Vec<DeviceInfo> {
        {
            let state = self.state.lock().await;
            if state.devices_loaded {
                return state.devices.clone();
            }
        }
        self.refresh_devices().await
    }

    pub async fn refresh_devices(&self) -> Vec<DeviceInfo> {
        let devices = self.backend.enumerate_devices().await;
        let mut state = self.state.lock().await;
        state.devices = devices.clone();
        state.devices_loaded = true;
        devices
    }

    pub async fn start(&self, request: CaptureRequest) -> SessionResult<CaptureSession> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        let _serialized = self.request_lock.lock().await;

        // Registered before the old grant is released so a stop issued during
        // the settle delay cancels this request too.
        let cancel = self.shutdown.child_token();
        let placeholder = CaptureSession::requesting(&request);
        {
            let mut state = self.state.lock().await;
            state.pending = Some((placeholder.clone(), cancel.clone()));
        }

        if self.release_current(EndReason::Replaced).await {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.settle_delay()) => {}
                _ = cancel.cancelled() => {
                    log_info!("capture request {} cancelled while settling", placeholder.id);
                    self.clear_pending(placeholder.id).await;
                    return Err(SessionError::Cancelled);
                }
            }
        }
        if cancel.is_cancelled() {
            self.clear_pending(placeholder.id).await;
            return Err(SessionError::Cancelled);
        }

        log_info!("requesting {:?} capture", request.kind);
        self.emit(CaptureEvent::Changed(Some(placeholder.clone())));

        let backend = self.backend.clone();
        let pending_request = request.clone();
        let mut acquisition =
            tokio::spawn(async move { backend.acquire(&pending_request).await });

        let outcome = tokio::select! {
            joined = &mut acquisition => joined,
            _ = cancel.cancelled() => {
                let backend = self.backend.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(grant)) = acquisition.await {
                        log_warn!("grant {} arrived after cancellation; releasing", grant.id);
                        backend.release(grant.id).await;
                    }
                });
                self.clear_pending(placeholder.id).await;
                return Err(SessionError::Cancelled);
            }
        };

        let grant = match outcome {
            Ok(Ok(grant)) => grant,
            Ok(Err(err)) => {
                log_warn!("capture request failed: {err}");
                self.clear_pending(placeholder.id).await;
                return Err(err);
            }
            Err(join_err) => {
                log_error!("capture request task failed: {join_err}");
                self.clear_pending(placeholder.id).await;
                return Err(SessionError::DeviceUnavailable {
                    device_id: request.device_id.unwrap_or_else(|| "default".into()),
                });
            }
        };

        self.install(placeholder, grant, cancel).await
    }

    async fn install(
        &self,
        mut session: CaptureSession,
        grant: HardwareGrant,
        cancel: CancellationToken,
    ) -> SessionResult<CaptureSession> {
        let HardwareGrant {
            id: grant_id,
            device_id,
            has_audio,
            ended,
        } = grant;

        {
            let mut state = self.state.lock().await;
            let still_wanted = !cancel.is_cancelled()
                && matches!(&state.pending, Some((pending, _)) if pending.id == session.id);
            if !still_wanted {
                drop(state);
                log_warn!("grant {grant_id} no longer wanted; releasing");
                self.backend.release(grant_id).await;
                self.clear_pending(session.id).await;
                return Err(SessionError::Cancelled);
            }

            session.activate(device_id, has_audio);
            if session.kind == CaptureKind::Camera {
                state.last_camera_device = session.device_id.clone();
            }
            state.pending = None;
            state.current = Some(ActiveCapture {
                session: session.clone(),
                grant: grant_id,
                watcher: cancel.clone(),
            });
        }

        let manager = self.clone();
        let session_id = session.id;
        tokio::spawn(async move {
            tokio::select! {
                signal = ended => {
                    let reason = signal.unwrap_or(EndReason::DeviceLost);
                    manager.end_session(session_id, reason).await;
                }
                _ = cancel.cancelled() => {
                    manager.end_session(session_id, EndReason::Shutdown).await;
                }
            }
        });

        log_info!(
            "capture {} active ({:?}, device {:?})",
            session.id,
            session.kind,
            session.device_id
        );
        self.emit(CaptureEvent::Changed(Some(session.clone())));
        Ok(session)
    }

    /// Release the hardware behind `session_id`. Stopping an unknown or
    /// already-stopped session does nothing.
    pub async fn stop(&self, session_id: Uuid) {
        let cancelled_pending = {
            let mut state = self.state.lock().await;
            match &state.pending {
                Some((pending, cancel)) if pending.id == session_id => {
                    cancel.cancel();
                    state.pending = None;
                    true
                }
                _ => false,
            }
        };
        if cancelled_pending {
            log_info!("pending capture {session_id} cancelled");
            self.emit(CaptureEvent::Changed(None));
            return;
        }
        self.end_session(session_id, EndReason::Stopped).await;
    }

    /// Stop whatever is live, including a request still in flight.
    pub async fn stop_current(&self) {
        let (live, pending) = {
            let state = self.state.lock().await;
            (
                state.current.as_ref().map(|active| active.session.id),
                state.pending.as_ref().map(|(session, _)| session.id),
            )
        };
        if let Some(id) = pending {
            self.stop(id).await;
        }
        if let Some(id) = live {
            self.stop(id).await;
        }
    }

    pub async fn set_track_enabled(
        &self,
        session_id: Uuid,
        track: TrackKind,
        enabled: bool,
    ) -> SessionResult<CaptureSession> {
        let session = {
            let mut state = self.state.lock().await;
            let active = state
                .current
                .as_mut()
                .filter(|active| active.session.id == session_id)
                .ok_or(SessionError::NoActiveCapture)?;
            self.backend
                .set_track_enabled(active.grant, track, enabled)
                .await?;
            active.session.set_track(track, enabled);
            active.session.clone()
        };
        log_debug!("capture {session_id} {track:?} enabled={enabled}");
        self.emit(CaptureEvent::Changed(Some(session.clone())));
        Ok(session)
    }

    /// Flip one track of the live session.
    pub async fn toggle_track(&self, track: TrackKind) -> SessionResult<CaptureSession> {
        let session = {
            let state = self.state.lock().await;
            state
                .current
                .as_ref()
                .map(|active| active.session.clone())
                .ok_or(SessionError::NoActiveCapture)?
        };
        let enabled = session.is_muted(track);
        self.set_track_enabled(session.id, track, enabled).await
    }

    /// Replace a camera session with a screen share.
    pub async fn switch_to_screen_share(&self, session_id: Uuid) -> SessionResult<CaptureSession> {
        let audio_requested = {
            let state = self.state.lock().await;
            let active = state
                .current
                .as_ref()
                .filter(|active| active.session.id == session_id)
                .ok_or(SessionError::NoActiveCapture)?;
            active.session.audio_enabled
        };
        self.start(CaptureRequest {
            audio_requested,
            ..CaptureRequest::screen()
        })
        .await
    }

    /// Camera becomes screen share; screen share returns to the last camera.
    pub async fn switch_source(&self) -> SessionResult<CaptureSession> {
        let request = self.switch_request().await?;
        self.start(request).await
    }

    /// The request `switch_source` would issue for the live session.
    pub async fn switch_request(&self) -> SessionResult<CaptureRequest> {
        let state = self.state.lock().await;
        let session = state
            .current
            .as_ref()
            .map(|active| &active.session)
            .ok_or(SessionError::NoActiveCapture)?;
        let base = match session.kind {
            CaptureKind::Camera => CaptureRequest::screen(),
            CaptureKind::Screen => CaptureRequest::camera(state.last_camera_device.clone()),
        };
        Ok(CaptureRequest {
            audio_requested: session.audio_enabled,
            ..base
        })
    }

    /// Cancel any in-flight request and release the live grant. Further
    /// `start` calls fail with `Cancelled`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.release_current(EndReason::Shutdown).await;
        {
            let mut state = self.state.lock().await;
            if let Some((_, cancel)) = state.pending.take() {
                cancel.cancel();
            }
        }
        if let Some(handle) = self.device_watcher.lock().await.take() {
            handle.abort();
        }
        log_info!("capture manager shut down");
    }

    /// Cancels every task the manager owns without waiting. Grants still
    /// held are released by their watchers.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    async fn release_current(&self, reason: EndReason) -> bool {
        let session_id = {
            let state = self.state.lock().await;
            state.current.as_ref().map(|active| active.session.id)
        };
        match session_id {
            Some(id) => self.end_session(id, reason).await,
            None => false,
        }
    }

    /// Tear down `session_id` if it is still the live session. Returns
    /// whether anything was released.
    async fn end_session(&self, session_id: Uuid, reason: EndReason) -> bool {
        let ended = {
            let mut state = self.state.lock().await;
            match state.current.take() {
                Some(active) if active.session.id == session_id => Some(active),
                other => {
                    state.current = other;
                    None
                }
            }
        };
        let Some(mut active) = ended else {
            return false;
        };

        active.watcher.cancel();
        self.backend.release(active.grant).await;
        active.session.end(reason);
        log_info!("capture {} ended ({reason:?})", session_id);

        self.emit(CaptureEvent::Ended {
            session: active.session,
            reason,
        });
        self.emit(CaptureEvent::Changed(None));
        true
    }

    async fn clear_pending(&self, session_id: Uuid) {
        let cleared = {
            let mut state = self.state.lock().await;
            match &state.pending {
                Some((pending, _)) if pending.id == session_id => {
                    state.pending = None;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            self.emit(CaptureEvent::Changed(None));
        }
    }

    fn emit(&self, event: CaptureEvent) {
        if self.events.send(event).is_err() {
            log_debug!("capture event dropped, no listener");
        }
    }
}

async fn device_watch_loop(manager: CaptureManager, mut changes: broadcast::Receiver<()>) {
    let shutdown = manager.shutdown.clone();
    loop {
        tokio::select! {
            change = changes.recv() => {
                match change {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let devices = manager.refresh_devices().await;
                        log_info!("device list changed ({} devices)", devices.len());
                        manager.emit(CaptureEvent::DevicesChanged(devices));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::session::CaptureLifecycle;
    use crate::capture::simulated::{PermissionPolicy, SimulatedMediaBackend};
    use std::time::Duration;

    fn setup() -> (
        CaptureManager,
        mpsc::UnboundedReceiver<CaptureEvent>,
        Arc<SimulatedMediaBackend>,
    ) {
        let backend = Arc::new(
            SimulatedMediaBackend::with_default_devices().with_latency(Duration::from_millis(200)),
        );
        let (manager, rx) = CaptureManager::new(backend.clone(), CaptureSettings::default());
        (manager, rx, backend)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CaptureEvent>) -> Vec<CaptureEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn start_activates_camera_with_both_tracks() {
        let (manager, mut rx, backend) = setup();
        let session = manager.start(CaptureRequest::camera(None)).await.unwrap();

        assert_eq!(session.lifecycle, CaptureLifecycle::Active);
        assert!(session.video_enabled && session.audio_enabled);
        assert_eq!(session.device_id.as_deref(), Some("cam-front"));
        assert_eq!(backend.live_grants(), 1);

        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            CaptureEvent::Changed(Some(s)) if s.lifecycle == CaptureLifecycle::Requesting
        ));
        assert!(matches!(
            events.last(),
            Some(CaptureEvent::Changed(Some(s))) if s.lifecycle == CaptureLifecycle::Active
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_releases_before_reacquiring() {
        let (manager, _rx, backend) = setup();
        let first = manager.start(CaptureRequest::camera(None)).await.unwrap();
        let second = manager
            .start(CaptureRequest::camera(Some("cam-usb".into())))
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(backend.live_grants(), 1);
        assert_eq!(backend.peak_grants(), 1);
        assert_eq!(manager.current().await.unwrap().id, second.id);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let (manager, mut rx, backend) = setup();
        let session = manager.start(CaptureRequest::camera(None)).await.unwrap();
        drain(&mut rx);

        manager.stop(session.id).await;
        let after_first = (manager.current().await, backend.live_grants());
        let first_events = drain(&mut rx);

        manager.stop(session.id).await;
        assert_eq!((manager.current().await, backend.live_grants()), after_first);
        assert_eq!(after_first, (None, 0));
        assert!(drain(&mut rx).is_empty());
        assert!(first_events.iter().any(|e| matches!(
            e,
            CaptureEvent::Ended { reason: EndReason::Stopped, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn muting_audio_leaves_video_and_lifecycle() {
        let (manager, _rx, backend) = setup();
        let session = manager.start(CaptureRequest::camera(None)).await.unwrap();

        let muted = manager
            .set_track_enabled(session.id, TrackKind::Audio, false)
            .await
            .unwrap();

        assert!(!muted.audio_enabled);
        assert!(muted.video_enabled);
        assert_eq!(muted.lifecycle, session.lifecycle);
        assert_eq!(backend.track_state(1), Some((true, false)));

        let toggled = manager.toggle_track(TrackKind::Audio).await.unwrap();
        assert!(toggled.audio_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_is_a_typed_error() {
        let (manager, mut rx, backend) = setup();
        backend.set_policy(PermissionPolicy::DenyCamera);

        let err = manager.start(CaptureRequest::camera(None)).await.unwrap_err();
        assert_eq!(err, SessionError::PermissionDenied);
        assert!(manager.current().await.is_none());
        assert!(matches!(drain(&mut rx).last(), Some(CaptureEvent::Changed(None))));
    }

    #[tokio::test(start_paused = true)]
    async fn unplugged_camera_ends_the_session() {
        let (manager, mut rx, backend) = setup();
        manager
            .start(CaptureRequest::camera(Some("cam-usb".into())))
            .await
            .unwrap();
        drain(&mut rx);

        backend.unplug("cam-usb");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(manager.current().await.is_none());
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            CaptureEvent::Ended { reason: EndReason::DeviceLost, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            CaptureEvent::DevicesChanged(devices) if devices.len() == 1
        )));
        assert_eq!(manager.list_devices().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn screen_share_revocation_ends_like_a_stop() {
        let (manager, mut rx, backend) = setup();
        let camera = manager.start(CaptureRequest::camera(None)).await.unwrap();
        let screen = manager.switch_to_screen_share(camera.id).await.unwrap();
        assert_eq!(screen.kind, CaptureKind::Screen);
        assert_eq!(backend.live_grants(), 1);
        drain(&mut rx);

        backend.revoke_screen_share();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(manager.current().await.is_none());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            CaptureEvent::Ended { session, reason: EndReason::ShareRevoked }
                if session.lifecycle == CaptureLifecycle::Ended
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn switch_source_returns_to_last_camera() {
        let (manager, _rx, _backend) = setup();
        manager
            .start(CaptureRequest::camera(Some("cam-usb".into())))
            .await
            .unwrap();
        let screen = manager.switch_source().await.unwrap();
        assert_eq!(screen.kind, CaptureKind::Screen);
        let camera = manager.switch_source().await.unwrap();
        assert_eq!(camera.kind, CaptureKind::Camera);
        assert_eq!(camera.device_id.as_deref(), Some("cam-usb"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_request_releases_late_grant() {
        let (manager, _rx, backend) = setup();
        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start(CaptureRequest::camera(None)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.shutdown().await;

        assert_eq!(pending.await.unwrap().unwrap_err(), SessionError::Cancelled);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(backend.acquisitions(), 1);
        assert_eq!(backend.live_grants(), 0);
        assert_eq!(
            manager.start(CaptureRequest::camera(None)).await.unwrap_err(),
            SessionError::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_settle_delay_cancels_the_replacement() {
        let (manager, _rx, backend) = setup();
        manager.start(CaptureRequest::camera(None)).await.unwrap();

        let starter = manager.clone();
        let replacement = tokio::spawn(async move {
            starter
                .start(CaptureRequest::camera(Some("cam-usb".into())))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop_current().await;

        assert_eq!(replacement.await.unwrap(), Err(SessionError::Cancelled));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(manager.current().await.is_none());
        assert_eq!(backend.live_grants(), 0);
        assert_eq!(backend.acquisitions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_releases_live_grant() {
        let (manager, _rx, backend) = setup();
        manager.start(CaptureRequest::camera(None)).await.unwrap();
        manager.cancel_all();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.live_grants(), 0);
    }
}
