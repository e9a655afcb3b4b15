//! Durable, ordered event queue
//!
//! The in-memory sequence is authoritative while the process runs. Every
//! mutation ships a full snapshot to a persistence task over a channel; the
//! task owns the [`KeyValueStore`] and is the only thing that touches it.
//! Appends do not wait for the write, removals and replacements do.

use crate::errors::{PipelineError, Result};
use crate::event::WireEvent;
use crate::store::KeyValueStore;
use crate::validator;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Store key holding the serialized queue
pub const STORE_KEY: &str = "events";

/// Hard ceiling on events per collector request
pub const MAX_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct PersistPolicy {
    /// Extra attempts after a failed write
    pub retries: u32,
    pub backoff_ms: u64,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Queued,
    /// Queue is at capacity; the event was not added
    Full,
    /// An event with the same id is already queued
    Duplicate,
}

/// What `initialize` found in the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovered {
    /// Events put back on the queue
    pub restored: usize,
    /// Names of stored events dropped because they no longer validate
    pub discarded: Vec<String>,
}

struct StoredQueue {
    events: Vec<WireEvent>,
    discarded: Vec<String>,
}

enum PersistCommand {
    Init {
        reply: oneshot::Sender<Result<StoredQueue>>,
    },
    Persist {
        events: Vec<WireEvent>,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
}

struct Persister {
    store: Arc<dyn KeyValueStore>,
    policy: PersistPolicy,
}

impl Persister {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<PersistCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                PersistCommand::Init { reply } => {
                    let _ = reply.send(self.load().await);
                }
                PersistCommand::Persist { events, ack } => {
                    let result = self.persist(&events).await;
                    if let Err(e) = &result {
                        error!("Failed to persist {} queued events: {}", events.len(), e);
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                }
            }
        }
        debug!("Persistence task stopped");
    }

    /// An unreadable stored value is logged and treated as empty; the first
    /// write after startup replaces it.
    async fn load(&self) -> Result<StoredQueue> {
        self.store.ready().await?;

        let mut loaded = StoredQueue {
            events: Vec::new(),
            discarded: Vec::new(),
        };

        let Some(raw) = self.store.get(STORE_KEY).await? else {
            return Ok(loaded);
        };

        let stored: Vec<WireEvent> = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                error!("Stored queue is unreadable, starting empty: {}", e);
                return Ok(loaded);
            }
        };

        for event in stored {
            if validator::validate(&event) {
                loaded.events.push(event);
            } else {
                loaded.discarded.push(event.name);
            }
        }

        if !loaded.discarded.is_empty() {
            warn!("Discarded {} invalid events from the store", loaded.discarded.len());
        }

        Ok(loaded)
    }

    async fn persist(&self, events: &[WireEvent]) -> Result<()> {
        let encoded = serde_json::to_string(events)?;
        let mut attempt = 0;

        loop {
            match self.store.set(STORE_KEY, &encoded).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.policy.retries => {
                    let backoff_ms = self.policy.backoff_ms * 2_u64.pow(attempt);
                    attempt += 1;
                    warn!(
                        "Store write failed (attempt {}), retrying in {}ms: {}",
                        attempt, backoff_ms, e
                    );
                    sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug)]
pub struct EventQueue {
    events: RwLock<Vec<WireEvent>>,
    max_len: usize,
    /// No store writes until the stored sequence has been merged in
    initialized: AtomicBool,
    commands: mpsc::UnboundedSender<PersistCommand>,
}

impl EventQueue {
    /// Create the queue and spawn its persistence task on the current runtime.
    pub fn spawn(store: Arc<dyn KeyValueStore>, max_len: usize, policy: PersistPolicy) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(Persister { store, policy }.run(rx));

        Self {
            events: RwLock::new(Vec::new()),
            max_len,
            initialized: AtomicBool::new(false),
            commands,
        }
    }

    /// Wait for the store, then put stored events ahead of anything appended
    /// since startup.
    pub async fn initialize(&self) -> Result<Recovered> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PersistCommand::Init { reply })
            .map_err(|_| PipelineError::ChannelClosed)?;
        let StoredQueue {
            events: stored,
            discarded,
        } = rx.await.map_err(|_| PipelineError::ChannelClosed)??;
        let restored = stored.len();

        {
            let mut events = self.events.write().await;
            let known: HashSet<String> = stored.iter().map(|e| e.id.clone()).collect();
            let mut merged = stored;
            merged.extend(events.drain(..).filter(|e| !known.contains(&e.id)));
            *events = merged;

            self.initialized.store(true, Ordering::Release);
            self.send_snapshot(&events, None);
        }

        info!("Event queue initialized with {} stored events", restored);
        Ok(Recovered {
            restored,
            discarded,
        })
    }

    pub async fn get_all(&self) -> Vec<WireEvent> {
        self.events.read().await.clone()
    }

    /// The oldest events, at most [`MAX_BATCH_SIZE`] of them
    pub async fn get_batch(&self) -> Vec<WireEvent> {
        let events = self.events.read().await;
        let count = std::cmp::min(MAX_BATCH_SIZE, events.len());
        events[..count].to_vec()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Push to the back and schedule a durable write without waiting for it.
    pub async fn append(&self, event: WireEvent) -> AppendOutcome {
        let mut events = self.events.write().await;

        if events.len() >= self.max_len {
            warn!("Event queue full ({} events), refusing {}", events.len(), event.name);
            return AppendOutcome::Full;
        }

        if events.iter().any(|e| e.id == event.id) {
            warn!("Event id {} already queued, refusing {}", event.id, event.name);
            return AppendOutcome::Duplicate;
        }

        events.push(event);
        debug!("Queued event, current size: {}", events.len());
        self.send_snapshot(&events, None);

        AppendOutcome::Queued
    }

    /// Drop every event whose id is listed, waiting for the durable write.
    /// Returns how many events were removed.
    pub async fn remove_by_ids(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let (ack, rx) = oneshot::channel();
        let removed = {
            let mut events = self.events.write().await;
            let before = events.len();
            events.retain(|e| !wanted.contains(e.id.as_str()));
            self.send_snapshot(&events, Some(ack));
            before - events.len()
        };

        debug!("Removed {} events from the queue", removed);
        Self::wait_for_write(rx).await?;
        Ok(removed)
    }

    /// Overwrite the whole sequence, waiting for the durable write.
    pub async fn replace_all(&self, replacement: Vec<WireEvent>) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        {
            let mut events = self.events.write().await;
            *events = replacement;
            self.send_snapshot(&events, Some(ack));
        }

        Self::wait_for_write(rx).await
    }

    /// Write the current sequence and wait for it. Earlier fire-and-forget
    /// writes land first.
    pub async fn checkpoint(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        {
            let events = self.events.read().await;
            self.send_snapshot(&events, Some(ack));
        }

        Self::wait_for_write(rx).await
    }

    /// Collapse repeated ids to their last occurrence in one step, waiting
    /// for the durable write. Returns how many events were dropped.
    pub async fn deduplicate(&self) -> Result<usize> {
        let (ack, rx) = oneshot::channel();
        let dropped = {
            let mut events = self.events.write().await;
            let before = events.len();
            *events = dedupe_keep_last(std::mem::take(&mut *events));
            self.send_snapshot(&events, Some(ack));
            before - events.len()
        };

        if dropped > 0 {
            warn!("Dropped {} events with repeated ids", dropped);
        }
        Self::wait_for_write(rx).await?;
        Ok(dropped)
    }

    /// Hand a snapshot to the persistence task. Called with the write lock
    /// held so snapshots reach the store in mutation order.
    fn send_snapshot(&self, events: &[WireEvent], ack: Option<oneshot::Sender<Result<()>>>) {
        if !self.initialized.load(Ordering::Acquire) {
            if let Some(ack) = ack {
                let _ = ack.send(Ok(()));
            }
            return;
        }

        let command = PersistCommand::Persist {
            events: events.to_vec(),
            ack,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            error!("Persistence task is gone, queue is memory-only");
            if let PersistCommand::Persist { ack: Some(ack), .. } = command {
                let _ = ack.send(Err(PipelineError::ChannelClosed));
            }
        }
    }

    async fn wait_for_write(rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        rx.await.map_err(|_| PipelineError::ChannelClosed)?
    }
}

/// Keep only the last occurrence of every id, in the order those last
/// occurrences appear.
pub fn dedupe_keep_last(events: Vec<WireEvent>) -> Vec<WireEvent> {
    let mut seen = HashSet::new();
    let mut kept: Vec<WireEvent> = events
        .into_iter()
        .rev()
        .filter(|e| seen.insert(e.id.clone()))
        .collect();
    kept.reverse();
    kept
}
