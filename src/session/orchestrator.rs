use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex as StdMutex, MutexGuard,
};

use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capture::{
    CaptureEvent, CaptureKind, CaptureManager, CaptureRequest, CaptureSession, DeviceInfo,
    MediaBackend, RetryPolicy, RetryTracker, SimulatedMediaBackend, TrackKind,
};
use crate::error::{SessionError, SessionResult};
use crate::settings::EngineSettings;
use crate::transport::{
    ChatMessage, ConnectionState, OutboundEvent, SessionTransport, SimulatedTransportFactory,
    TransportEnvelope, TransportFactory,
};
use crate::workout::{
    RandomWalkVitals, VitalsSource, WorkoutController, WorkoutEvent, WorkoutRunView,
};
use crate::{log_debug, log_info, log_warn};

use super::snapshot::{CaptureErrorView, SessionSnapshot, SessionView};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "pulsefit::session";

/// View state plus the channel that republishes it.
struct Shared {
    view: Mutex<SessionView>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl Shared {
    /// Run `apply` against the view and publish a new snapshot if it
    /// reports a change.
    async fn update<F>(&self, apply: F)
    where
        F: FnOnce(&mut SessionView) -> bool,
    {
        let mut view = self.view.lock().await;
        if apply(&mut view) {
            self.snapshots.send_replace(view.snapshot());
        }
    }
}

struct Inner {
    settings: EngineSettings,
    capture: CaptureManager,
    workout: WorkoutController,
    transports: Arc<dyn TransportFactory>,
    transport: StdMutex<Option<Arc<dyn SessionTransport>>>,
    transport_tx: mpsc::UnboundedSender<TransportEnvelope>,
    next_connection: AtomicU64,
    retry: Mutex<RetryTracker>,
    shared: Arc<Shared>,
    /// Cancelled first on shutdown; commands fail with `ShutDown` after.
    closing: CancellationToken,
    /// Cancelled last; stops the event pump.
    pump_stop: CancellationToken,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn transport_slot(&self) -> MutexGuard<'_, Option<Arc<dyn SessionTransport>>> {
        match self.transport.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.closing.cancel();
        self.capture.cancel_all();
        self.workout.cancel_all();
        if let Some(transport) = self.transport_slot().take() {
            transport.close();
        }
        self.pump_stop.cancel();
    }
}

/// Wires capture, transport and workout together behind one command surface
/// and one snapshot stream.
///
/// Components never talk to each other; every cross-component effect is a
/// command issued here. Cloning is cheap and every clone drives the same
/// session. Dropping the last clone cancels every task the session owns.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    /// Must be called from within a tokio runtime.
    pub fn new(
        settings: EngineSettings,
        media: Arc<dyn MediaBackend>,
        transports: Arc<dyn TransportFactory>,
        vitals: Box<dyn VitalsSource>,
    ) -> Self {
        let (capture, capture_rx) = CaptureManager::new(media, settings.capture.clone());
        let (workout, initial_run, workout_rx) =
            WorkoutController::new(settings.routine.clone(), settings.workout.clone(), vitals);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let view = SessionView::new(
            settings.presence.clone(),
            settings.transport.chat_history_limit,
            initial_run,
        );
        let (snapshots, _) = watch::channel(view.snapshot());
        let shared = Arc::new(Shared {
            view: Mutex::new(view),
            snapshots,
        });

        let pump_stop = CancellationToken::new();
        let pump = tokio::spawn(event_pump(
            shared.clone(),
            capture_rx,
            transport_rx,
            workout_rx,
            pump_stop.clone(),
        ));

        let retry = RetryTracker::new(RetryPolicy::from_settings(&settings.capture.retry));
        log_info!("session engine ready ({} steps)", settings.routine.len());

        Self {
            inner: Arc::new(Inner {
                settings,
                capture,
                workout,
                transports,
                transport: StdMutex::new(None),
                transport_tx,
                next_connection: AtomicU64::new(1),
                retry: Mutex::new(retry),
                shared,
                closing: CancellationToken::new(),
                pump_stop,
                pump: StdMutex::new(Some(pump)),
            }),
        }
    }

    /// Fully simulated engine: default devices, simulated server and
    /// random-walk vitals.
    pub fn simulated(settings: EngineSettings) -> (Self, Arc<SimulatedMediaBackend>) {
        let media = Arc::new(SimulatedMediaBackend::with_default_devices());
        let transports = Arc::new(SimulatedTransportFactory::new(settings.transport.clone()));
        let orchestrator = Self::new(
            settings,
            media.clone(),
            transports,
            Box::new(RandomWalkVitals::new()),
        );
        (orchestrator, media)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.shared.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.shared.snapshots.borrow().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    fn ensure_running(&self) -> SessionResult<()> {
        if self.inner.closing.is_cancelled() {
            Err(SessionError::ShutDown)
        } else {
            Ok(())
        }
    }

    // ---- capture ----

    pub async fn start_capture(
        &self,
        kind: CaptureKind,
        device_id: Option<String>,
    ) -> SessionResult<CaptureSession> {
        self.ensure_running()?;
        let request = match kind {
            CaptureKind::Camera => CaptureRequest::camera(device_id),
            CaptureKind::Screen => CaptureRequest::screen(),
        };
        self.inner.retry.lock().await.reset();
        self.issue_capture(request).await
    }

    pub async fn stop_capture(&self) -> SessionResult<()> {
        self.ensure_running()?;
        self.inner.capture.stop_current().await;
        Ok(())
    }

    pub async fn toggle_track(&self, track: TrackKind) -> SessionResult<CaptureSession> {
        self.ensure_running()?;
        self.inner.capture.toggle_track(track).await
    }

    pub async fn switch_source(&self) -> SessionResult<CaptureSession> {
        self.ensure_running()?;
        let request = self.inner.capture.switch_request().await?;
        self.inner.retry.lock().await.reset();
        self.issue_capture(request).await
    }

    /// Re-issue the last failed capture request after its backoff.
    pub async fn retry_capture(&self) -> SessionResult<CaptureSession> {
        self.ensure_running()?;
        let next = self.inner.retry.lock().await.next_retry();
        let (request, backoff) = match next {
            Ok(next) => next,
            Err(err) => {
                if matches!(err, SessionError::RetriesExhausted { .. }) {
                    let error = CaptureErrorView {
                        error: err.clone(),
                        retry_available: false,
                    };
                    self.inner
                        .shared
                        .update(|view| {
                            view.set_capture_error(Some(error));
                            true
                        })
                        .await;
                }
                return Err(err);
            }
        };

        log_info!("retrying {:?} capture in {:?}", request.kind, backoff);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = self.inner.closing.cancelled() => return Err(SessionError::ShutDown),
        }
        self.issue_capture(request).await
    }

    pub async fn list_devices(&self) -> SessionResult<Vec<DeviceInfo>> {
        self.ensure_running()?;
        let devices = self.inner.capture.list_devices().await;
        let cached = devices.clone();
        self.inner
            .shared
            .update(move |view| view.set_devices(cached))
            .await;
        Ok(devices)
    }

    async fn issue_capture(&self, request: CaptureRequest) -> SessionResult<CaptureSession> {
        let result = self.inner.capture.start(request.clone()).await;
        let error = {
            let mut retry = self.inner.retry.lock().await;
            match &result {
                Ok(_) => {
                    retry.record_success();
                    None
                }
                Err(err) if err.is_retryable() => {
                    retry.record_failure(request);
                    Some(CaptureErrorView {
                        error: err.clone(),
                        retry_available: retry.retry_available(),
                    })
                }
                Err(err) => {
                    log_debug!("capture request not retryable: {err}");
                    None
                }
            }
        };
        if let Err(err) = &result {
            log_warn!("capture request failed: {err}");
        }
        self.inner
            .shared
            .update(move |view| {
                view.set_capture_error(error);
                true
            })
            .await;
        result
    }

    // ---- transport ----

    /// Open a connection and wait until it is usable. A live connection is
    /// reused; a closed one is replaced, which is how a reconnect happens.
    pub async fn connect_transport(&self) -> SessionResult<()> {
        self.ensure_running()?;
        {
            let mut view = self.inner.shared.view.lock().await;
            if self.replace_closed_transport(&mut view) {
                self.inner.shared.snapshots.send_replace(view.snapshot());
            }
        }

        let mut updates = self.subscribe();
        let wait_settled = async {
            updates
                .wait_for(|snapshot| {
                    matches!(
                        snapshot.connection,
                        Some(ConnectionState::Open) | Some(ConnectionState::Closed)
                    )
                })
                .await
                .map(|snapshot| snapshot.connection)
        };
        let settled = tokio::select! {
            settled = wait_settled => settled,
            _ = self.inner.closing.cancelled() => return Err(SessionError::ShutDown),
        };
        match settled {
            Ok(Some(ConnectionState::Open)) => Ok(()),
            Ok(_) => Err(SessionError::ConnectionClosed),
            Err(_) => Err(SessionError::ShutDown),
        }
    }

    /// Open a new connection unless a live one exists. The view learns the
    /// new connection id before the transport can emit anything, and holding
    /// the view serializes concurrent connects.
    fn replace_closed_transport(&self, view: &mut SessionView) -> bool {
        let mut slot = self.inner.transport_slot();
        let reusable = slot
            .as_ref()
            .map(|transport| transport.state() != ConnectionState::Closed)
            .unwrap_or(false);
        if reusable {
            return false;
        }
        let connection_id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        view.begin_connection(connection_id);
        let transport = self
            .inner
            .transports
            .connect(connection_id, self.inner.transport_tx.clone());
        *slot = Some(transport);
        log_info!("transport connection {connection_id} requested");
        true
    }

    /// Close the live connection, if any. No reconnect is attempted.
    pub async fn disconnect_transport(&self) -> SessionResult<()> {
        self.ensure_running()?;
        let transport = self.inner.transport_slot().clone();
        if let Some(transport) = transport {
            transport.close();
        }
        Ok(())
    }

    fn live_transport(&self) -> SessionResult<Arc<dyn SessionTransport>> {
        self.inner
            .transport_slot()
            .clone()
            .ok_or(SessionError::NotConnected)
    }

    /// Show the message immediately and reconcile it when the server echo
    /// arrives. A rejected send leaves no trace in the message list.
    pub async fn send_chat(&self, body: impl Into<String>) -> SessionResult<ChatMessage> {
        self.ensure_running()?;
        let transport = self.live_transport()?;
        let body = body.into();
        let client_id = Uuid::new_v4().to_string();
        let author = self.inner.settings.transport.local_author.clone();

        // The view lock is held across the send so the echo cannot be
        // applied before the optimistic copy exists.
        let mut view = self.inner.shared.view.lock().await;
        let message = view
            .messages_mut()
            .push_optimistic(client_id.clone(), author, body.clone());
        let sent = transport.send(OutboundEvent::ChatSend {
            body,
            client_id: Some(client_id.clone()),
        });
        if let Err(err) = sent {
            view.messages_mut().discard_pending(&client_id);
            log_debug!("chat send rejected: {err}");
            return Err(err);
        }
        self.inner.shared.snapshots.send_replace(view.snapshot());
        Ok(message)
    }

    pub async fn set_typing(&self, is_typing: bool) -> SessionResult<()> {
        self.ensure_running()?;
        let transport = self.live_transport()?;
        transport.send(OutboundEvent::Typing {
            author: self.inner.settings.transport.local_author.clone(),
            is_typing,
        })
    }

    // ---- workout ----

    pub async fn start_workout(&self) -> SessionResult<WorkoutRunView> {
        self.ensure_running()?;
        Ok(self.inner.workout.start().await)
    }

    pub async fn pause_workout(&self) -> SessionResult<WorkoutRunView> {
        self.ensure_running()?;
        Ok(self.inner.workout.pause().await)
    }

    pub async fn resume_workout(&self) -> SessionResult<WorkoutRunView> {
        self.ensure_running()?;
        Ok(self.inner.workout.resume().await)
    }

    pub async fn skip_step(&self) -> SessionResult<WorkoutRunView> {
        self.ensure_running()?;
        Ok(self.inner.workout.skip().await)
    }

    // ---- teardown ----

    /// Stop accepting commands, then release capture, stop the workout
    /// ticker, close the transport and finally stop the event pump once it
    /// has applied what those steps emitted. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.closing.is_cancelled() {
            return;
        }
        self.inner.closing.cancel();
        log_info!("session shutting down");

        self.inner.capture.shutdown().await;
        self.inner.workout.shutdown().await;
        let transport = self.inner.transport_slot().take();
        if let Some(transport) = transport {
            transport.close();
        }

        self.inner.pump_stop.cancel();
        let pump = match self.inner.pump.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        log_info!("session shut down");
    }
}

/// Merge the three component streams and the presence expiry timer into the
/// shared view. There is no ordering across sources.
async fn event_pump(
    shared: Arc<Shared>,
    mut capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEnvelope>,
    mut workout_rx: mpsc::UnboundedReceiver<WorkoutEvent>,
    stop: CancellationToken,
) {
    loop {
        let deadline = shared.view.lock().await.next_deadline();
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = stop.cancelled() => break,
            Some(event) = capture_rx.recv() => {
                shared.update(|view| view.apply_capture(event)).await;
            }
            Some(envelope) = transport_rx.recv() => {
                log_debug!("inbound {} on connection {}", envelope.event.kind(), envelope.connection_id);
                shared
                    .update(|view| view.apply_transport(envelope, Instant::now()))
                    .await;
            }
            Some(event) = workout_rx.recv() => {
                shared.update(|view| view.apply_workout(event, Instant::now())).await;
            }
            _ = expiry => {
                shared.update(|view| view.expire(Instant::now())).await;
            }
        }
    }

    // Apply whatever teardown emitted so the final snapshot shows it.
    let now = Instant::now();
    let mut view = shared.view.lock().await;
    let mut changed = false;
    while let Ok(event) = capture_rx.try_recv() {
        changed |= view.apply_capture(event);
    }
    while let Ok(envelope) = transport_rx.try_recv() {
        changed |= view.apply_transport(envelope, now);
    }
    while let Ok(event) = workout_rx.try_recv() {
        changed |= view.apply_workout(event, now);
    }
    if changed {
        shared.snapshots.send_replace(view.snapshot());
    }
    log_debug!("event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureLifecycle, PermissionPolicy};
    use crate::transport::FixedScheduler;
    use crate::workout::{Category, ExerciseStep, RunStatus, SteadyVitals};
    use std::time::Duration;

    fn settings() -> EngineSettings {
        EngineSettings {
            routine: vec![
                ExerciseStep::new("Jacks", 5, Category::Warmup),
                ExerciseStep::new("Plank", 5, Category::Core),
            ],
            ..EngineSettings::default()
        }
    }

    fn quiet_engine() -> (SessionOrchestrator, Arc<SimulatedMediaBackend>) {
        quiet_engine_with(settings())
    }

    fn quiet_engine_with(
        settings: EngineSettings,
    ) -> (SessionOrchestrator, Arc<SimulatedMediaBackend>) {
        let media = Arc::new(
            SimulatedMediaBackend::with_default_devices().with_latency(Duration::from_millis(100)),
        );
        let transports = Arc::new(SimulatedTransportFactory::with_scheduler(
            settings.transport.clone(),
            || Box::new(FixedScheduler::default()),
        ));
        let engine =
            SessionOrchestrator::new(settings, media.clone(), transports, Box::new(SteadyVitals));
        (engine, media)
    }

    #[tokio::test(start_paused = true)]
    async fn chat_round_trip_leaves_one_message() {
        let (engine, _media) = quiet_engine();
        engine.connect_transport().await.unwrap();

        let sent = engine.send_chat("hi").await.unwrap();
        assert!(sent.pending);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].body, "hi");
        assert!(!snapshot.messages[0].pending);
        assert_ne!(snapshot.messages[0].id, sent.id);
    }

    #[tokio::test(start_paused = true)]
    async fn chat_history_keeps_the_newest_messages() {
        let mut settings = settings();
        settings.transport.chat_history_limit = 2;
        let (engine, _media) = quiet_engine_with(settings);
        engine.connect_transport().await.unwrap();

        for body in ["one", "two", "three"] {
            engine.send_chat(body).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let bodies: Vec<String> = engine
            .snapshot()
            .messages
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["two".to_string(), "three".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_snapshot_tracks_the_controller_run() {
        let (engine, _media) = quiet_engine();
        let before = engine.snapshot().workout_run;
        assert_eq!(before.status, RunStatus::Stopped);

        let started = engine.start_workout().await.unwrap();
        assert_eq!(started.run_id, before.run_id);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_source_switch_leaves_capture_idle() {
        let (engine, media) = quiet_engine();
        engine.start_capture(CaptureKind::Camera, None).await.unwrap();

        let switcher = engine.clone();
        let switching = tokio::spawn(async move { switcher.switch_source().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop_capture().await.unwrap();

        assert_eq!(
            switching.await.unwrap().unwrap_err(),
            SessionError::Cancelled
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(engine.snapshot().capture.is_none());
        assert_eq!(media.live_grants(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn chat_before_connect_is_rejected_without_a_trace() {
        let (engine, _media) = quiet_engine();
        assert_eq!(
            engine.send_chat("x").await.unwrap_err(),
            SessionError::NotConnected
        );
        assert!(engine.snapshot().messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_can_be_replaced() {
        let (engine, _media) = quiet_engine();
        engine.connect_transport().await.unwrap();
        engine.disconnect_transport().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.snapshot().connection, Some(ConnectionState::Closed));
        assert_eq!(
            engine.send_chat("late").await.unwrap_err(),
            SessionError::ConnectionClosed
        );

        engine.connect_transport().await.unwrap();
        assert_eq!(engine.snapshot().connection, Some(ConnectionState::Open));
        assert!(engine.send_chat("back").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn denied_capture_offers_bounded_retries() {
        let (engine, media) = quiet_engine();
        media.set_policy(PermissionPolicy::DenyAll);

        let err = engine
            .start_capture(CaptureKind::Camera, None)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::PermissionDenied);
        let shown = engine.snapshot().capture_error.unwrap();
        assert!(shown.retry_available);

        for _ in 0..3 {
            assert_eq!(
                engine.retry_capture().await.unwrap_err(),
                SessionError::PermissionDenied
            );
        }
        assert!(matches!(
            engine.retry_capture().await.unwrap_err(),
            SessionError::RetriesExhausted { .. }
        ));
        assert!(!engine.snapshot().capture_error.unwrap().retry_available);

        media.set_policy(PermissionPolicy::Grant);
        let session = engine.start_capture(CaptureKind::Camera, None).await.unwrap();
        assert_eq!(session.lifecycle, CaptureLifecycle::Active);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.snapshot().capture_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_everything_and_refuses_commands() {
        let (engine, media) = quiet_engine();
        engine.connect_transport().await.unwrap();
        engine.start_capture(CaptureKind::Camera, None).await.unwrap();
        engine.start_workout().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        engine.shutdown().await;
        engine.shutdown().await;
        assert_eq!(media.live_grants(), 0);

        let snapshot = engine.snapshot();
        assert!(snapshot.capture.is_none());
        assert_eq!(snapshot.connection, Some(ConnectionState::Closed));
        let frozen = snapshot.workout_run.clone();
        assert_eq!(frozen.status, RunStatus::Running);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.snapshot().workout_run, frozen);
        assert_eq!(
            engine.start_workout().await.unwrap_err(),
            SessionError::ShutDown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_a_pending_capture() {
        let (engine, media) = quiet_engine();
        let starter = engine.clone();
        let pending = tokio::spawn(async move {
            starter.start_capture(CaptureKind::Camera, None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        engine.shutdown().await;
        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err(), SessionError::Cancelled);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(media.live_grants(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_last_handle_stops_the_ticker_and_transport() {
        let (engine, media) = quiet_engine();
        let mut updates = engine.subscribe();
        engine.connect_transport().await.unwrap();
        engine.start_capture(CaptureKind::Camera, None).await.unwrap();
        engine.start_workout().await.unwrap();
        drop(engine);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(media.live_grants(), 0);
        drop(updates.borrow_and_update());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!updates.has_changed().unwrap_or(false));
    }
}
