//! Request batching: coalesces concurrently-submitted commands for the
//! same key into one backend round trip.
//!
//! Per key there is at most one open batch (still accepting commands) and
//! at most one in-flight batch (sealed and awaiting the backend). Requests
//! arriving while a batch is in flight accumulate in the next open batch,
//! which serializes backend writes per key; requests for different keys
//! never merge and never block each other.

use std::sync::mpsc;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::bucket::{Command, CommandResult};
use crate::error::{FloodgateError, Result};

use super::listener::{NoopListener, OptimizationListener};
use super::{AsyncCommandExecutor, CommandExecutor};

/// One caller's slot in a batch: how many outcomes it is owed and where
/// to deliver them.
struct PendingRequest<T> {
    command: Command,
    tx: T,
}

/// Flatten pending commands into a single wave, remembering how many
/// outcomes each caller gets back.
fn seal_wave<T>(pendings: Vec<PendingRequest<T>>) -> (Vec<Command>, Vec<(usize, T)>) {
    let mut commands = Vec::with_capacity(pendings.len());
    let mut slots = Vec::with_capacity(pendings.len());
    for pending in pendings {
        match pending.command {
            // A caller's compound joins the wave as its sub-commands so
            // the caller gets its per-sub-command outcomes back intact.
            Command::Compound { commands: subs } => {
                slots.push((subs.len(), pending.tx));
                commands.extend(subs);
            }
            other => {
                slots.push((1, pending.tx));
                commands.push(other);
            }
        }
    }
    (commands, slots)
}

/// Split a wave result back into per-caller results, in submission order.
fn demux(result: CommandResult, slots: Vec<(usize, impl FnOnce(Result<CommandResult>))>) {
    let mut outcomes = result.outcomes.into_iter();
    for (span, complete) in slots {
        let portion: Vec<_> = outcomes.by_ref().take(span).collect();
        complete(Ok(CommandResult { outcomes: portion }));
    }
}

fn wave_command(mut commands: Vec<Command>) -> Command {
    if commands.len() == 1 {
        commands.pop().unwrap()
    } else {
        Command::compound(commands)
    }
}

struct KeyBatch<T> {
    open: Vec<PendingRequest<T>>,
    /// Whether a combiner currently owns this key (a batch is being built
    /// or is in flight).
    active: bool,
}

impl<T> Default for KeyBatch<T> {
    fn default() -> Self {
        Self {
            open: Vec::new(),
            active: false,
        }
    }
}

type AsyncSender = oneshot::Sender<Result<CommandResult>>;
type SyncSender = mpsc::Sender<Result<CommandResult>>;

/// Batching decorator over an asynchronous executor.
///
/// The first request for an idle key spawns a drain task that seals and
/// sends waves until the key has no waiting requests; later requests just
/// enqueue and await their result channel.
pub struct AsyncBatchingExecutor<E> {
    inner: Arc<E>,
    keys: Arc<DashMap<String, Arc<Mutex<KeyBatch<AsyncSender>>>>>,
    listener: Arc<dyn OptimizationListener>,
}

impl<E: AsyncCommandExecutor + 'static> AsyncBatchingExecutor<E> {
    /// Wrap `inner` with request batching.
    pub fn new(inner: E) -> Self {
        Self {
            inner: Arc::new(inner),
            keys: Arc::new(DashMap::new()),
            listener: Arc::new(NoopListener),
        }
    }

    /// Attach an optimization listener.
    pub fn with_listener(mut self, listener: Arc<dyn OptimizationListener>) -> Self {
        self.listener = listener;
        self
    }

    fn slot(&self, key: &str) -> Arc<Mutex<KeyBatch<AsyncSender>>> {
        self.keys.entry(key.to_string()).or_default().clone()
    }

    async fn drain(
        inner: Arc<E>,
        slot: Arc<Mutex<KeyBatch<AsyncSender>>>,
        key: String,
        listener: Arc<dyn OptimizationListener>,
    ) {
        loop {
            let pendings = {
                let mut batch = slot.lock();
                if batch.open.is_empty() {
                    batch.active = false;
                    return;
                }
                std::mem::take(&mut batch.open)
            };

            // Sealed: from here on this wave is in flight and newly
            // arriving requests build the next open batch.
            let (commands, slots) = seal_wave(pendings);
            let expected = commands.len();
            if expected >= 2 {
                listener.commands_merged(expected as u64);
            }
            trace!(key = %key, commands = expected, "Batch sealed");

            match inner.execute(&key, wave_command(commands)).await {
                Ok(result) if result.outcomes.len() == expected => {
                    demux(
                        result,
                        slots
                            .into_iter()
                            .map(|(span, tx)| {
                                (span, move |r: Result<CommandResult>| {
                                    // A dropped receiver is a cancelled
                                    // caller; the rest of the batch is
                                    // unaffected.
                                    let _ = tx.send(r);
                                })
                            })
                            .collect(),
                    );
                }
                Ok(result) => {
                    let error = FloodgateError::Transport(format!(
                        "backend returned {} outcomes for a batch of {}",
                        result.outcomes.len(),
                        expected
                    ));
                    for (_, tx) in slots {
                        let _ = tx.send(Err(error.clone()));
                    }
                }
                Err(error) => {
                    for (_, tx) in slots {
                        let _ = tx.send(Err(error.clone()));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<E: AsyncCommandExecutor + 'static> AsyncCommandExecutor for AsyncBatchingExecutor<E> {
    async fn execute(&self, key: &str, command: Command) -> Result<CommandResult> {
        let (tx, rx) = oneshot::channel();
        let slot = self.slot(key);

        let becomes_combiner = {
            let mut batch = slot.lock();
            batch.open.push(PendingRequest { command, tx });
            if batch.active {
                false
            } else {
                batch.active = true;
                true
            }
        };

        if becomes_combiner {
            tokio::spawn(Self::drain(
                self.inner.clone(),
                slot,
                key.to_string(),
                self.listener.clone(),
            ));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(FloodgateError::Transport(
                "batch completed without delivering a result".to_string(),
            )),
        }
    }
}

/// Batching decorator over a synchronous executor.
///
/// Flat combining: the first thread to arrive at an idle key becomes the
/// combiner and executes waves (its own and those of threads that queue
/// up behind it) until the key drains; the other threads block on their
/// result channels.
pub struct BatchingExecutor<E> {
    inner: E,
    keys: DashMap<String, Arc<Mutex<KeyBatch<SyncSender>>>>,
    listener: Arc<dyn OptimizationListener>,
}

impl<E: CommandExecutor> BatchingExecutor<E> {
    /// Wrap `inner` with request batching.
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            keys: DashMap::new(),
            listener: Arc::new(NoopListener),
        }
    }

    /// Attach an optimization listener.
    pub fn with_listener(mut self, listener: Arc<dyn OptimizationListener>) -> Self {
        self.listener = listener;
        self
    }

    fn combine(&self, key: &str, slot: &Mutex<KeyBatch<SyncSender>>) {
        loop {
            let pendings = {
                let mut batch = slot.lock();
                if batch.open.is_empty() {
                    batch.active = false;
                    return;
                }
                std::mem::take(&mut batch.open)
            };

            let (commands, slots) = seal_wave(pendings);
            let expected = commands.len();
            if expected >= 2 {
                self.listener.commands_merged(expected as u64);
            }
            trace!(key = %key, commands = expected, "Batch sealed");

            match self.inner.execute(key, wave_command(commands)) {
                Ok(result) if result.outcomes.len() == expected => {
                    demux(
                        result,
                        slots
                            .into_iter()
                            .map(|(span, tx)| {
                                (span, move |r: Result<CommandResult>| {
                                    let _ = tx.send(r);
                                })
                            })
                            .collect(),
                    );
                }
                Ok(result) => {
                    let error = FloodgateError::Transport(format!(
                        "backend returned {} outcomes for a batch of {}",
                        result.outcomes.len(),
                        expected
                    ));
                    for (_, tx) in slots {
                        let _ = tx.send(Err(error.clone()));
                    }
                }
                Err(error) => {
                    for (_, tx) in slots {
                        let _ = tx.send(Err(error.clone()));
                    }
                }
            }
        }
    }
}

impl<E: CommandExecutor> CommandExecutor for BatchingExecutor<E> {
    fn execute(&self, key: &str, command: Command) -> Result<CommandResult> {
        let (tx, rx) = mpsc::channel();
        let slot = self.keys.entry(key.to_string()).or_default().clone();

        let becomes_combiner = {
            let mut batch = slot.lock();
            batch.open.push(PendingRequest { command, tx });
            if batch.active {
                false
            } else {
                batch.active = true;
                true
            }
        };

        if becomes_combiner {
            self.combine(key, &slot);
        }

        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(FloodgateError::Transport(
                "batch completed without delivering a result".to_string(),
            )),
        }
    }
}
