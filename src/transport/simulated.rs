use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{SessionError, SessionResult};
use crate::settings::TransportSettings;
use crate::{log_debug, log_info};

use super::protocol::{InboundEvent, OutboundEvent};
use super::scheduler::{PushKind, PushScheduler, RandomScheduler};
use super::{ConnectionState, SessionTransport, TransportEnvelope, TransportFactory};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "pulsefit::transport";

const RECENT_MESSAGES: usize = 20;
const TYPING_STOP_CHANCE: f64 = 0.6;
const TYPING_HOLD: Duration = Duration::from_millis(1_500);

struct Connection {
    state: ConnectionState,
    participant_count: u32,
    next_message: u64,
    recent_ids: VecDeque<String>,
}

struct EchoJob {
    id: String,
    body: String,
    client_id: Option<String>,
}

/// State shared between the transport handle and its server tasks.
struct Server {
    connection_id: u64,
    settings: TransportSettings,
    connection: Mutex<Connection>,
    scheduler: Mutex<Box<dyn PushScheduler>>,
    events: mpsc::UnboundedSender<TransportEnvelope>,
    cancel: CancellationToken,
}

impl Server {
    fn connection(&self) -> MutexGuard<'_, Connection> {
        match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn scheduler(&self) -> MutexGuard<'_, Box<dyn PushScheduler>> {
        match self.scheduler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: InboundEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.events.send(TransportEnvelope {
            connection_id: self.connection_id,
            event,
        });
    }

    fn assign_message_id(&self) -> String {
        let mut conn = self.connection();
        conn.next_message += 1;
        let id = format!("msg-{}-{}", self.connection_id, conn.next_message);
        conn.recent_ids.push_back(id.clone());
        if conn.recent_ids.len() > RECENT_MESSAGES {
            conn.recent_ids.pop_front();
        }
        id
    }

    fn pick<'a>(&self, choices: &'a [String]) -> Option<&'a String> {
        if choices.is_empty() {
            return None;
        }
        let index = self.scheduler().pick(choices.len());
        choices.get(index.min(choices.len() - 1))
    }

    /// Sleep unless the connection is torn down first. Returns false on teardown.
    async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    fn push(&self, kind: PushKind) -> Option<String> {
        match kind {
            PushKind::Chat => {
                let author = self.pick(&self.settings.remote_authors)?.clone();
                let body = self.pick(&self.settings.chat_lines)?.clone();
                let id = self.assign_message_id();
                self.emit(InboundEvent::ChatReceived {
                    id,
                    author,
                    body,
                    sent_at: Utc::now(),
                    client_id: None,
                });
                None
            }
            PushKind::Typing => {
                let author = self.pick(&self.settings.remote_authors)?.clone();
                self.emit(InboundEvent::Typing {
                    author: author.clone(),
                    is_typing: true,
                });
                Some(author)
            }
            PushKind::Reaction => {
                let message_id = {
                    let conn = self.connection();
                    if conn.recent_ids.is_empty() {
                        return None;
                    }
                    let index = self.scheduler().pick(conn.recent_ids.len());
                    conn.recent_ids.get(index)?.clone()
                };
                let symbol = self.pick(&self.settings.reaction_symbols)?.clone();
                self.emit(InboundEvent::Reaction { message_id, symbol });
                None
            }
            PushKind::Participants => {
                let up = self.scheduler().chance(0.5);
                let count = {
                    let mut conn = self.connection();
                    let max = self.settings.max_participants.max(1);
                    conn.participant_count = if up {
                        (conn.participant_count + 1).min(max)
                    } else {
                        conn.participant_count.saturating_sub(1).max(1)
                    };
                    conn.participant_count
                };
                self.emit(InboundEvent::ParticipantCount { count });
                None
            }
        }
    }
}

/// Locally simulated session server.
///
/// After `connect_delay_ms` the connection opens and independent loops start
/// pushing chat, typing, reaction and participant-count events on randomized
/// intervals. Each kind is produced by a single loop, so delivery is FIFO
/// within a kind and unordered across kinds.
pub struct SimulatedTransport {
    server: Arc<Server>,
    echo_tx: mpsc::UnboundedSender<EchoJob>,
}

impl SimulatedTransport {
    pub fn connect(
        connection_id: u64,
        settings: TransportSettings,
        scheduler: Box<dyn PushScheduler>,
        events: mpsc::UnboundedSender<TransportEnvelope>,
    ) -> Self {
        let server = Arc::new(Server {
            connection_id,
            connection: Mutex::new(Connection {
                state: ConnectionState::Connecting,
                participant_count: settings.initial_participants,
                next_message: 0,
                recent_ids: VecDeque::new(),
            }),
            settings,
            scheduler: Mutex::new(scheduler),
            events,
            cancel: CancellationToken::new(),
        });

        let (echo_tx, echo_rx) = mpsc::unbounded_channel();
        tokio::spawn(open_after_delay(server.clone()));
        tokio::spawn(echo_loop(server.clone(), echo_rx));
        log_info!("connection {connection_id} connecting");

        Self { server, echo_tx }
    }
}

impl SessionTransport for SimulatedTransport {
    fn connection_id(&self) -> u64 {
        self.server.connection_id
    }

    fn state(&self) -> ConnectionState {
        self.server.connection().state
    }

    fn participant_count(&self) -> u32 {
        self.server.connection().participant_count
    }

    fn send(&self, event: OutboundEvent) -> SessionResult<()> {
        match self.state() {
            ConnectionState::Connecting => return Err(SessionError::NotConnected),
            ConnectionState::Closed => return Err(SessionError::ConnectionClosed),
            ConnectionState::Open => {}
        }

        match event {
            OutboundEvent::ChatSend { body, client_id } => {
                let id = self.server.assign_message_id();
                log_debug!("chat {id} accepted");
                self.echo_tx
                    .send(EchoJob {
                        id,
                        body,
                        client_id,
                    })
                    .map_err(|_| SessionError::ConnectionClosed)
            }
            OutboundEvent::Typing { author, is_typing } => {
                log_debug!("typing from {author}: {is_typing}");
                Ok(())
            }
        }
    }

    fn close(&self) {
        {
            let mut conn = self.server.connection();
            if conn.state == ConnectionState::Closed {
                return;
            }
            conn.state = ConnectionState::Closed;
        }
        self.server.emit(InboundEvent::Close);
        self.server.cancel.cancel();
        log_info!("connection {} closed", self.server.connection_id);
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.server.cancel.cancel();
    }
}

async fn open_after_delay(server: Arc<Server>) {
    let delay = Duration::from_millis(server.settings.connect_delay_ms);
    if !server.wait(delay).await {
        return;
    }

    let participants = {
        let mut conn = server.connection();
        if conn.state != ConnectionState::Connecting {
            return;
        }
        conn.state = ConnectionState::Open;
        conn.participant_count
    };
    log_info!("connection {} open", server.connection_id);
    server.emit(InboundEvent::Open);
    server.emit(InboundEvent::ParticipantCount {
        count: participants,
    });

    for kind in [
        PushKind::Chat,
        PushKind::Typing,
        PushKind::Reaction,
        PushKind::Participants,
    ] {
        tokio::spawn(push_loop(server.clone(), kind));
    }
}

async fn push_loop(server: Arc<Server>, kind: PushKind) {
    loop {
        let delay = server.scheduler().next_delay(kind);
        if !server.wait(delay).await {
            break;
        }
        let Some(typing_author) = server.push(kind) else {
            continue;
        };
        let stops = server.scheduler().chance(TYPING_STOP_CHANCE);
        if stops {
            if !server.wait(TYPING_HOLD).await {
                break;
            }
            server.emit(InboundEvent::Typing {
                author: typing_author,
                is_typing: false,
            });
        }
    }
}

async fn echo_loop(server: Arc<Server>, mut jobs: mpsc::UnboundedReceiver<EchoJob>) {
    let delay = Duration::from_millis(server.settings.echo_delay_ms);
    let author = server.settings.local_author.clone();
    loop {
        let job = tokio::select! {
            job = jobs.recv() => job,
            _ = server.cancel.cancelled() => None,
        };
        let Some(job) = job else {
            break;
        };
        if !server.wait(delay).await {
            break;
        }
        server.emit(InboundEvent::ChatReceived {
            id: job.id,
            author: author.clone(),
            body: job.body,
            sent_at: Utc::now(),
            client_id: job.client_id,
        });
    }
}

type SchedulerFactory = Box<dyn Fn() -> Box<dyn PushScheduler> + Send + Sync>;

pub struct SimulatedTransportFactory {
    settings: TransportSettings,
    schedulers: SchedulerFactory,
}

impl SimulatedTransportFactory {
    pub fn new(settings: TransportSettings) -> Self {
        let for_scheduler = settings.clone();
        Self {
            settings,
            schedulers: Box::new(move || Box::new(RandomScheduler::new(&for_scheduler))),
        }
    }

    pub fn with_scheduler<F>(settings: TransportSettings, schedulers: F) -> Self
    where
        F: Fn() -> Box<dyn PushScheduler> + Send + Sync + 'static,
    {
        Self {
            settings,
            schedulers: Box::new(schedulers),
        }
    }
}

impl TransportFactory for SimulatedTransportFactory {
    fn connect(
        &self,
        connection_id: u64,
        events: mpsc::UnboundedSender<TransportEnvelope>,
    ) -> Arc<dyn SessionTransport> {
        Arc::new(SimulatedTransport::connect(
            connection_id,
            self.settings.clone(),
            (self.schedulers)(),
            events,
        ))
    }
}
