//! Sync orchestrator: one lifecycle for fetch, push channel and fallback poll.
//!
//! All blocking work happens on helper threads (snapshot fetch, push channel, poll timer). They only
//! post events into one queue; `pump` drains it on the owning thread, which is the only code that
//! mutates the reconciler. Every event is stamped with the generation it was started under, and
//! events from an older generation are dropped.

use crate::channel::PushConnector;
use crate::error::SyncError;
use crate::models::fermentation::BatchStatusSnapshot;
use crate::services::live::{Backoff, ChannelHandle, ChannelState, LiveEvent, spawn_channel};
use crate::services::reconciler::{Reconciler, SubscriptionId};
use crate::services::snapshot::SnapshotSource;
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub reconnect: Backoff,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect: Backoff::default(),
        }
    }
}

enum SyncEvent {
    Snapshot {
        generation: u64,
        result: Result<Vec<BatchStatusSnapshot>, SyncError>,
    },
    PollTick {
        generation: u64,
    },
    Live {
        generation: u64,
        event: LiveEvent,
    },
}

impl SyncEvent {
    fn generation(&self) -> u64 {
        match self {
            SyncEvent::Snapshot { generation, .. }
            | SyncEvent::PollTick { generation }
            | SyncEvent::Live { generation, .. } => *generation,
        }
    }
}

/// Periodic tick source. Dropping the cancel sender wakes the thread immediately.
struct PollTimer {
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PollTimer {
    fn spawn(period: Duration, generation: u64, events: Sender<SyncEvent>) -> io::Result<Self> {
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new().name("fallback-poll".into()).spawn(move || {
            while let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(period) {
                if events.send(SyncEvent::PollTick { generation }).is_err() {
                    break;
                }
            }
        })?;
        Ok(PollTimer {
            cancel: Some(cancel_tx),
            thread: Some(thread),
        })
    }

    fn cancel(&mut self) {
        self.cancel.take();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

pub struct SyncOrchestrator<S: SnapshotSource, C: PushConnector> {
    source: Arc<S>,
    connector: Arc<C>,
    settings: SyncSettings,
    reconciler: Reconciler,
    events_tx: Sender<SyncEvent>,
    events_rx: Receiver<SyncEvent>,
    generation: u64,
    active: bool,
    fetch_in_flight: bool,
    channel: Option<ChannelHandle>,
    channel_state: ChannelState,
    timer: Option<PollTimer>,
    last_error: Option<SyncError>,
}

impl<S: SnapshotSource, C: PushConnector> SyncOrchestrator<S, C> {
    pub fn new(source: Arc<S>, connector: Arc<C>, reconciler: Reconciler, settings: SyncSettings) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        SyncOrchestrator {
            source,
            connector,
            settings,
            reconciler,
            events_tx,
            events_rx,
            generation: 0,
            active: false,
            fetch_in_flight: false,
            channel: None,
            channel_state: ChannelState::Closed { deliberate: false },
            timer: None,
            last_error: None,
        }
    }

    /// Read-only view for consumers.
    pub fn view(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn subscribe(&mut self, f: impl FnMut(&[BatchStatusSnapshot]) + 'static) -> SubscriptionId {
        self.reconciler.subscribe(f)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.reconciler.unsubscribe(id)
    }

    /// Most recent error seen by the subsystem; cleared by the next successful fetch.
    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Push channel state as last reported by the channel thread.
    pub fn channel_state(&self) -> ChannelState {
        self.channel_state
    }

    /// Start the initial fetch and arm the fallback poll. The push channel opens once the initial
    /// fetch has resolved.
    ///
    /// Whatever was started before a failure stays registered, so `deactivate` (or drop) always
    /// releases it.
    pub fn activate(&mut self) -> Result<(), SyncError> {
        if self.active {
            return Ok(());
        }
        self.generation += 1;
        self.active = true;
        self.fetch_in_flight = false;
        info!(
            "Sync: activating (generation={}, poll_interval={}s)",
            self.generation,
            self.settings.poll_interval.as_secs()
        );

        let timer = PollTimer::spawn(self.settings.poll_interval, self.generation, self.events_tx.clone())
            .map_err(|e| SyncError::Network(format!("spawning poll timer failed: {}", e)))?;
        self.timer = Some(timer);
        self.request_snapshot()
    }

    /// Close the push channel deliberately and cancel the poll. Idempotent; safe while a fetch is in
    /// flight, whose result is then discarded.
    pub fn deactivate(&mut self) {
        if !self.active && self.channel.is_none() && self.timer.is_none() {
            return;
        }
        self.generation += 1;
        self.active = false;
        self.fetch_in_flight = false;

        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        if let Some(mut timer) = self.timer.take() {
            timer.cancel();
        }
        self.channel_state = ChannelState::Closed { deliberate: true };
        info!("Sync: deactivated (generation={})", self.generation);
    }

    /// Run a fallback poll right away instead of waiting for the timer.
    pub fn poll_now(&mut self) -> Result<(), SyncError> {
        if !self.active {
            return Ok(());
        }
        self.request_snapshot()
    }

    /// Wait up to `timeout` for one event, then drain whatever else is queued. Returns the number of
    /// events handled, including discarded stale ones.
    pub fn pump(&mut self, timeout: Duration) -> usize {
        let first = match self.events_rx.recv_timeout(timeout) {
            Ok(event) => event,
            Err(_) => return 0,
        };
        self.handle(first);
        let mut handled = 1;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle(event);
            handled += 1;
        }
        handled
    }

    /// Process events until the process is stopped.
    pub fn run(&mut self) -> Result<(), String> {
        self.activate().map_err(|e| format!("activating sync failed: {}", e))?;
        loop {
            self.pump(Duration::from_secs(1));
        }
    }

    fn request_snapshot(&mut self) -> Result<(), SyncError> {
        if self.fetch_in_flight {
            debug!("Sync: snapshot fetch already in flight; skipping");
            return Ok(());
        }
        let source = Arc::clone(&self.source);
        let events = self.events_tx.clone();
        let generation = self.generation;
        thread::Builder::new()
            .name("snapshot-fetch".into())
            .spawn(move || {
                let result = source.fetch_snapshots();
                let _ = events.send(SyncEvent::Snapshot { generation, result });
            })
            .map_err(|e| SyncError::Network(format!("spawning snapshot fetch failed: {}", e)))?;
        self.fetch_in_flight = true;
        Ok(())
    }

    fn open_channel(&mut self) {
        let events = self.events_tx.clone();
        let generation = self.generation;
        let spawned = spawn_channel(Arc::clone(&self.connector), self.settings.reconnect, move |event| {
            events.send(SyncEvent::Live { generation, event }).is_ok()
        });
        match spawned {
            Ok(handle) => {
                self.channel = Some(handle);
                self.channel_state = ChannelState::Connecting;
            }
            Err(e) => self.record_error(SyncError::Network(format!("spawning push channel failed: {}", e))),
        }
    }

    fn handle(&mut self, event: SyncEvent) {
        if !self.active || event.generation() != self.generation {
            debug!(
                "Sync: discarding event from generation {} (current={}, active={})",
                event.generation(),
                self.generation,
                self.active
            );
            return;
        }

        match event {
            SyncEvent::Snapshot { result, .. } => {
                self.fetch_in_flight = false;
                match result {
                    Ok(snapshots) => {
                        let count = snapshots.len();
                        match self.reconciler.replace_all(snapshots) {
                            Ok(()) => {
                                debug!("Sync: snapshot applied ({} batch(es))", count);
                                self.last_error = None;
                            }
                            Err(e) => self.record_error(e),
                        }
                    }
                    Err(e) => self.record_error(e),
                }
                if self.channel.is_none() {
                    self.open_channel();
                }
            }
            SyncEvent::PollTick { .. } => {
                debug!("Sync: fallback poll");
                if let Err(e) = self.request_snapshot() {
                    self.record_error(e);
                }
            }
            SyncEvent::Live { event, .. } => self.handle_live(event),
        }
    }

    fn handle_live(&mut self, event: LiveEvent) {
        match event {
            LiveEvent::Connecting => self.channel_state = ChannelState::Connecting,
            LiveEvent::Opened => self.channel_state = ChannelState::Open,
            LiveEvent::Updates(updates) => {
                for update in &updates {
                    match self.reconciler.apply_partial(update) {
                        Ok(Some(_)) => debug!("Sync: merged live update for batch {}", update.batch_id.0),
                        Ok(None) => {}
                        Err(e) => self.record_error(e),
                    }
                }
            }
            LiveEvent::Rejected(e) => self.record_error(e),
            LiveEvent::Closed { deliberate, reason } => {
                self.channel_state = ChannelState::Closed { deliberate };
                if let Some(reason) = reason {
                    self.record_error(SyncError::Network(reason));
                }
            }
        }
    }

    fn record_error(&mut self, e: SyncError) {
        warn!("Sync: {}", e);
        self.last_error = Some(e);
    }
}

impl<S: SnapshotSource, C: PushConnector> Drop for SyncOrchestrator<S, C> {
    fn drop(&mut self) {
        self.deactivate();
    }
}
