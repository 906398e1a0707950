use crate::aggregator::{Aggregator, PollSnapshot, StoreView};
use crate::commands::{CommandDispatcher, CommandOutcome, CommandSink, MutationCommand};
use crate::config::EngineConfig;
use crate::error::TransportError;
use crate::notice::{Connectivity, Notice};
use crate::poll::{PollBatch, PollSource};
use crate::push::{PushItem, PushSession, PushSource};
use crate::selection::SelectionTracker;
use chatdesk_core::classify::{partition, CategoryViews};
use chatdesk_core::model::{ConversationKey, DispositionRef, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Init,
    PushActive,
    PollFallback,
    Suspended,
}

impl CoordinatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            CoordinatorState::Init => "init",
            CoordinatorState::PushActive => "push_active",
            CoordinatorState::PollFallback => "poll_fallback",
            CoordinatorState::Suspended => "suspended",
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Suspend,
    Resume,
    Shutdown,
}

type ConnectTask = JoinHandle<Result<Box<dyn PushSession>, TransportError>>;
type PollTask = JoinHandle<Result<PollBatch, TransportError>>;

/// Starts the coordinator on the current runtime. The returned handle is the
/// only way to reach the store; the task owns the single writer.
pub fn spawn(
    config: EngineConfig,
    push: Arc<dyn PushSource>,
    poll: Arc<dyn PollSource>,
    commands: Option<Arc<dyn CommandSink>>,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let aggregator = Aggregator::new(config.notice_capacity);
    let (control_tx, control_rx) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(CoordinatorState::Init);
    let handle = CoordinatorHandle {
        control_tx,
        state_rx,
        views: aggregator.subscribe(),
        notice_tx: aggregator.notice_sender(),
        commands: CommandDispatcher::new(
            commands,
            aggregator.subscribe(),
            aggregator.notice_sender(),
        ),
        standby_window: config.standby_window,
    };
    let backoff = config.backoff_initial;
    let coordinator = Coordinator {
        config,
        push,
        poll,
        aggregator,
        state: CoordinatorState::Init,
        state_tx,
        control_rx,
        session: None,
        last_push_at: Instant::now(),
        connecting: None,
        reconnect_at: None,
        backoff,
        connect_failures: 0,
        polling: None,
        poll_base: 0,
        next_poll_at: None,
        poll_failures: 0,
        degraded: false,
    };
    let task = tokio::spawn(coordinator.run());
    (handle, task)
}

/// Owns the aggregator and decides which producer feeds it.
///
/// Everything runs on one task: push frames, poll results and control
/// messages are applied one at a time, so the store never sees two writers.
struct Coordinator {
    config: EngineConfig,
    push: Arc<dyn PushSource>,
    poll: Arc<dyn PollSource>,
    aggregator: Aggregator,
    state: CoordinatorState,
    state_tx: watch::Sender<CoordinatorState>,
    control_rx: mpsc::Receiver<Control>,
    session: Option<Box<dyn PushSession>>,
    last_push_at: Instant,
    connecting: Option<ConnectTask>,
    reconnect_at: Option<Instant>,
    backoff: Duration,
    connect_failures: u32,
    polling: Option<PollTask>,
    poll_base: u64,
    next_poll_at: Option<Instant>,
    poll_failures: u32,
    degraded: bool,
}

impl Coordinator {
    async fn run(mut self) {
        info!(event = "coordinator_started", session_id = %self.config.session_id);
        self.start_connect();
        loop {
            let push_deadline = self.last_push_at + self.config.heartbeat_timeout;
            tokio::select! {
                control = self.control_rx.recv() => match control {
                    Some(Control::Suspend) => self.suspend(),
                    Some(Control::Resume) => self.resume(),
                    Some(Control::Shutdown) | None => break,
                },
                item = next_push(&mut self.session, push_deadline, self.config.heartbeat_timeout) => {
                    self.on_push(item);
                }
                joined = join_task(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connected(joined);
                }
                _ = sleep_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_connect();
                }
                _ = sleep_opt(self.next_poll_at) => {
                    self.next_poll_at = None;
                    self.start_poll();
                }
                joined = join_task(&mut self.polling) => {
                    self.polling = None;
                    self.on_polled(joined);
                }
            }
        }
        self.stop_tasks();
        info!(
            event = "coordinator_stopped",
            version = self.aggregator.version(),
            malformed_total = self.aggregator.malformed_total()
        );
    }

    fn set_state(&mut self, next: CoordinatorState) {
        if self.state == next {
            return;
        }
        info!(event = "coordinator_state", from = %self.state, to = %next);
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn signal(&mut self, connectivity: Connectivity) {
        let degraded = connectivity == Connectivity::Degraded;
        if self.degraded == degraded {
            return;
        }
        self.degraded = degraded;
        let _ = self
            .aggregator
            .notice_sender()
            .send(Notice::Connectivity(connectivity));
    }

    fn start_connect(&mut self) {
        if self.connecting.is_some() {
            return;
        }
        let push = Arc::clone(&self.push);
        self.connecting = Some(tokio::spawn(async move { push.connect().await }));
    }

    fn start_poll(&mut self) {
        if self.polling.is_some() {
            return;
        }
        self.poll_base = self.aggregator.version();
        let poll = Arc::clone(&self.poll);
        self.polling = Some(tokio::spawn(async move { poll.fetch_all().await }));
    }

    fn on_connected(
        &mut self,
        joined: Result<Result<Box<dyn PushSession>, TransportError>, JoinError>,
    ) {
        let result = joined
            .unwrap_or_else(|err| Err(TransportError::Unavailable(format!("connect task: {err}"))));
        match result {
            Ok(session) => {
                if self.connect_failures > 0 {
                    info!(event = "push_reconnected", failed_attempts = self.connect_failures);
                }
                self.session = Some(session);
                self.last_push_at = Instant::now();
                self.backoff = self.config.backoff_initial;
                self.connect_failures = 0;
                self.reconnect_at = None;
                self.next_poll_at = None;
                self.set_state(CoordinatorState::PushActive);
                self.signal(Connectivity::Restored);
                if self.config.bootstrap_snapshot {
                    self.start_poll();
                }
            }
            Err(err) => {
                self.connect_failures += 1;
                if self.connect_failures == 1 {
                    warn!(event = "push_connect_failed", error = %err);
                } else {
                    debug!(
                        event = "push_connect_failed",
                        error = %err,
                        attempts = self.connect_failures
                    );
                }
                if self.state == CoordinatorState::PollFallback {
                    self.schedule_reconnect();
                } else {
                    self.enter_fallback();
                }
            }
        }
    }

    fn on_push(&mut self, item: Result<Option<PushItem>, TransportError>) {
        match item {
            Ok(Some(PushItem::Event(msg))) => {
                self.last_push_at = Instant::now();
                self.aggregator.ingest_wire(msg);
            }
            Ok(Some(PushItem::Malformed(err))) => {
                self.last_push_at = Instant::now();
                self.aggregator.record_malformed("push_frame", &err.to_string());
            }
            Ok(None) => {
                warn!(event = "push_closed");
                self.enter_fallback();
            }
            Err(err) => {
                warn!(event = "push_lost", error = %err);
                self.enter_fallback();
            }
        }
    }

    fn on_polled(&mut self, joined: Result<Result<PollBatch, TransportError>, JoinError>) {
        let result = joined
            .unwrap_or_else(|err| Err(TransportError::Unavailable(format!("poll task: {err}"))));
        match result {
            Ok(batch) => {
                self.poll_failures = 0;
                self.aggregator.ingest_snapshot(PollSnapshot {
                    base_version: self.poll_base,
                    messages: batch.messages,
                    rejected: batch.rejected,
                });
            }
            Err(err) => {
                self.poll_failures += 1;
                if self.poll_failures == 1 {
                    warn!(event = "poll_failed", error = %err);
                } else {
                    debug!(event = "poll_failed", error = %err, attempts = self.poll_failures);
                }
            }
        }
        if self.state == CoordinatorState::PollFallback {
            self.next_poll_at = Some(Instant::now() + self.config.effective_poll_interval());
        }
    }

    fn enter_fallback(&mut self) {
        self.session = None;
        self.set_state(CoordinatorState::PollFallback);
        self.signal(Connectivity::Degraded);
        if self.polling.is_none() {
            self.next_poll_at = Some(Instant::now());
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        debug!(event = "push_reconnect_scheduled", delay_ms = self.backoff.as_millis() as u64);
        self.reconnect_at = Some(Instant::now() + self.backoff);
        self.backoff = self.config.next_backoff(self.backoff);
    }

    fn stop_tasks(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(task) = self.polling.take() {
            task.abort();
        }
        self.session = None;
        self.reconnect_at = None;
        self.next_poll_at = None;
    }

    /// In-flight work is aborted and its results never reach the store.
    fn suspend(&mut self) {
        self.stop_tasks();
        self.set_state(CoordinatorState::Suspended);
    }

    fn resume(&mut self) {
        if self.state != CoordinatorState::Suspended || self.connecting.is_some() {
            return;
        }
        info!(event = "coordinator_resuming");
        self.backoff = self.config.backoff_initial;
        self.start_connect();
    }
}

async fn next_push(
    session: &mut Option<Box<dyn PushSession>>,
    deadline: Instant,
    heartbeat: Duration,
) -> Result<Option<PushItem>, TransportError> {
    let Some(session) = session.as_mut() else {
        return pending().await;
    };
    match timeout_at(deadline, session.next_event()).await {
        Ok(item) => item,
        Err(_) => Err(TransportError::Timeout(heartbeat)),
    }
}

async fn join_task<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match task.as_mut() {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Cloneable entry point for observers and callers.
#[derive(Clone)]
pub struct CoordinatorHandle {
    control_tx: mpsc::Sender<Control>,
    state_rx: watch::Receiver<CoordinatorState>,
    views: watch::Receiver<StoreView>,
    notice_tx: broadcast::Sender<Notice>,
    commands: CommandDispatcher,
    standby_window: chrono::Duration,
}

impl CoordinatorHandle {
    pub async fn suspend(&self) {
        self.send(Control::Suspend).await;
    }

    pub async fn resume(&self) {
        self.send(Control::Resume).await;
    }

    pub async fn shutdown(&self) {
        self.send(Control::Shutdown).await;
    }

    async fn send(&self, control: Control) {
        if self.control_tx.send(control).await.is_err() {
            debug!(event = "coordinator_gone", control = ?control);
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    pub fn view(&self) -> StoreView {
        self.views.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreView> {
        self.views.clone()
    }

    /// Calls `callback` with the current listing and again after every
    /// change, until the coordinator stops.
    pub fn subscribe_with<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(&StoreView) + Send + 'static,
    {
        let mut views = self.views.clone();
        tokio::spawn(async move {
            loop {
                let view = views.borrow_and_update().clone();
                callback(&view);
                if views.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notice_tx.subscribe()
    }

    pub fn tracker(&self) -> SelectionTracker {
        SelectionTracker::new(self.views.clone())
    }

    pub fn categories(&self, now: DateTime<Utc>) -> CategoryViews {
        let view = self.views.borrow();
        partition(&view.groups, now, self.standby_window)
    }

    pub async fn transfer_conversation(
        &self,
        message_id: MessageId,
        target_operator: impl Into<String>,
    ) -> CommandOutcome {
        self.commands
            .dispatch(MutationCommand::Transfer {
                message_id,
                target_operator: target_operator.into(),
            })
            .await
    }

    pub async fn tabulate_conversation(
        &self,
        key: ConversationKey,
        disposition: DispositionRef,
    ) -> CommandOutcome {
        self.commands
            .dispatch(MutationCommand::Tabulate { key, disposition })
            .await
    }

    pub async fn delete_conversation(&self, contact: impl Into<String>) -> CommandOutcome {
        self.commands
            .dispatch(MutationCommand::Delete {
                contact: contact.into(),
            })
            .await
    }
}
