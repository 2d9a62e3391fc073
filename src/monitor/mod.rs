//! Connection stream monitor.
//!
//! One actor task owns the [`ConnectionTable`] and the reconnect state machine.
//! Transports (push stream or poll loop) and backend calls run on their own
//! tasks and hand their results back over a channel, so every mutation happens
//! on the actor in arrival order. Observers read [`MonitorView`] from a
//! `watch` channel.

mod snapshot;
mod state;
mod table;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::{Backend, BackendError, BackendResult, ConnectionFeed};

pub use snapshot::{ConnectionEntry, ConnectionMetadata, ConnectionSnapshot};
pub use state::{
    ErrorTracker, FailureAction, MonitorState, ReconnectMachine, ERROR_THRESHOLD, ERROR_WINDOW,
    RETRY_BACKOFF,
};
pub use table::{ConnectionRecord, ConnectionTable};

/// What observers of the monitor see after every change
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorView {
    pub state: MonitorState,
    /// Newest first
    pub connections: Vec<ConnectionRecord>,
    pub upload_total: u64,
    pub download_total: u64,
    pub upload_speed: u64,
    pub download_speed: u64,
    pub alive_count: usize,
}

impl Default for MonitorView {
    fn default() -> Self {
        Self {
            state: MonitorState::Disconnected,
            connections: Vec::new(),
            upload_total: 0,
            download_total: 0,
            upload_speed: 0,
            download_speed: 0,
            alive_count: 0,
        }
    }
}

enum Command {
    Start(Arc<dyn Backend>),
    Stop,
    /// `None` closes every connection
    Close {
        id: Option<String>,
        reply: oneshot::Sender<BackendResult<()>>,
    },
    ClearClosed {
        reply: oneshot::Sender<usize>,
    },
}

enum Event {
    Snapshot {
        generation: u64,
        snapshot: ConnectionSnapshot,
    },
    Decode {
        generation: u64,
        error: BackendError,
    },
    Failure {
        generation: u64,
        error: BackendError,
    },
    RetryDue {
        generation: u64,
    },
    Closed {
        id: Option<String>,
        result: BackendResult<()>,
        reply: oneshot::Sender<BackendResult<()>>,
    },
}

fn actor_gone() -> BackendError {
    BackendError::Config("connection monitor has shut down".to_string())
}

/// Handle to a running monitor actor
#[derive(Debug)]
pub struct ConnectionMonitor {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<MonitorView>,
}

impl ConnectionMonitor {
    /// Spawn the actor; it idles in `Disconnected` until [`start`](Self::start).
    pub fn spawn() -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(MonitorView::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let actor = MonitorActor {
            backend: None,
            table: ConnectionTable::new(),
            machine: ReconnectMachine::new(),
            generation: 0,
            transport: None,
            retry: None,
            events: events_tx,
            view: view_tx,
        };
        tokio::spawn(actor.run(commands_rx, events_rx));

        Self { commands, view }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("connection monitor is gone, command dropped");
        }
    }

    pub fn start(&self, backend: Arc<dyn Backend>) {
        self.send(Command::Start(backend));
    }

    /// Halt monitoring and discard the table; the state becomes `Paused`.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorView> {
        self.view.clone()
    }

    pub fn view(&self) -> MonitorView {
        self.view.borrow().clone()
    }

    /// Ask the backend to close one connection, then mark it closed locally.
    pub async fn close_connection(&self, id: &str) -> BackendResult<()> {
        self.close(Some(id.to_string())).await
    }

    pub async fn close_all(&self) -> BackendResult<()> {
        self.close(None).await
    }

    async fn close(&self, id: Option<String>) -> BackendResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Close { id, reply })
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Purge closed records; returns how many were removed.
    pub async fn clear_closed(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::ClearClosed { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

struct MonitorActor {
    backend: Option<Arc<dyn Backend>>,
    table: ConnectionTable,
    machine: ReconnectMachine,
    /// Bumped for every transport attempt; events tagged with an older value are ignored
    generation: u64,
    transport: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<Event>,
    view: watch::Sender<MonitorView>,
}

impl MonitorActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        self.cancel_tasks();
        tracing::debug!("connection monitor finished");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(backend) => {
                tracing::info!(kind = %backend.kind(), "monitor starting");
                self.cancel_tasks();
                self.backend = Some(backend);
                self.table = ConnectionTable::new();
                self.machine = ReconnectMachine::new();
                self.open_transport();
            }
            Command::Stop => {
                tracing::info!("monitor stopped");
                self.cancel_tasks();
                self.generation += 1;
                self.backend = None;
                self.table = ConnectionTable::new();
                self.machine.on_stop();
                self.publish();
            }
            Command::Close { id, reply } => self.request_close(id, reply),
            Command::ClearClosed { reply } => {
                let removed = self.table.clear_closed();
                if removed > 0 {
                    self.publish();
                }
                let _ = reply.send(removed);
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Snapshot {
                generation,
                snapshot,
            } => {
                if generation != self.generation {
                    tracing::debug!(generation, "snapshot from superseded transport skipped");
                    return;
                }
                let state_changed = self.machine.on_receive();
                let table_changed = self.table.reconcile(snapshot, Utc::now());
                if state_changed || table_changed {
                    self.publish();
                }
            }
            Event::Decode { generation, error } => {
                if generation == self.generation {
                    tracing::warn!(%error, "undecodable snapshot skipped");
                }
            }
            Event::Failure { generation, error } => {
                if generation != self.generation {
                    return;
                }
                self.transport = None;
                let now = tokio::time::Instant::now().into_std();
                match self.machine.on_failure(&error, now) {
                    FailureAction::Retry(delay) => self.schedule_retry(delay),
                    FailureAction::AlreadyRetrying => {}
                    FailureAction::Halt => self.cancel_tasks(),
                }
                self.publish();
            }
            Event::RetryDue { generation } => {
                if generation != self.generation {
                    return;
                }
                self.retry = None;
                self.machine.on_retry_due();
                self.open_transport();
            }
            Event::Closed { id, result, reply } => {
                if result.is_ok() {
                    let now = Utc::now();
                    let changed = match &id {
                        Some(id) => self.table.mark_closed(id, now),
                        None => self.table.mark_all_closed(now) > 0,
                    };
                    if changed {
                        self.publish();
                    }
                }
                let _ = reply.send(result);
            }
        }
    }

    fn open_transport(&mut self) {
        let Some(backend) = self.backend.clone() else {
            return;
        };
        self.generation += 1;
        self.machine.on_connecting();
        self.publish();

        let generation = self.generation;
        let events = self.events.clone();
        let task = match backend.connection_feed() {
            ConnectionFeed::Stream => tokio::spawn(run_stream(backend, generation, events)),
            ConnectionFeed::Poll(interval) => {
                tokio::spawn(run_poll(backend, interval, generation, events))
            }
        };
        self.transport = Some(task);
    }

    fn schedule_retry(&mut self, delay: Duration) {
        let generation = self.generation;
        let events = self.events.clone();
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::RetryDue { generation });
        }));
    }

    fn request_close(&mut self, id: Option<String>, reply: oneshot::Sender<BackendResult<()>>) {
        let Some(backend) = self.backend.clone() else {
            let _ = reply.send(Err(BackendError::Config(
                "monitor is not running".to_string(),
            )));
            return;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match &id {
                Some(id) => backend.close_connection(id).await,
                None => backend.close_all_connections().await,
            };
            if let Err(error) = &result {
                tracing::warn!(id = id.as_deref().unwrap_or("*"), %error, "close request failed");
            }
            let _ = events.send(Event::Closed { id, result, reply });
        });
    }

    fn cancel_tasks(&mut self) {
        if let Some(task) = self.transport.take() {
            task.abort();
        }
        if let Some(task) = self.retry.take() {
            task.abort();
        }
    }

    fn publish(&self) {
        let (upload_total, download_total) = self.table.totals();
        let (upload_speed, download_speed) = self.table.speeds();
        self.view.send_replace(MonitorView {
            state: self.machine.state().clone(),
            connections: self.table.ordered().to_vec(),
            upload_total,
            download_total,
            upload_speed,
            download_speed,
            alive_count: self.table.alive_count(),
        });
    }
}

async fn run_stream(
    backend: Arc<dyn Backend>,
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut stream = match backend.open_connection_stream().await {
        Ok(stream) => stream,
        Err(error) => {
            let _ = events.send(Event::Failure { generation, error });
            return;
        }
    };

    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(snapshot) => Event::Snapshot {
                generation,
                snapshot,
            },
            Err(error) if error.is_decode() => Event::Decode { generation, error },
            Err(error) => {
                let _ = events.send(Event::Failure { generation, error });
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }

    let _ = events.send(Event::Failure {
        generation,
        error: BackendError::Transport("connection stream ended".to_string()),
    });
}

async fn run_poll(
    backend: Arc<dyn Backend>,
    interval: Duration,
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let event = match backend.fetch_connections().await {
            Ok(snapshot) => Event::Snapshot {
                generation,
                snapshot,
            },
            Err(error) if error.is_decode() => Event::Decode { generation, error },
            Err(error) => {
                let _ = events.send(Event::Failure { generation, error });
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}
