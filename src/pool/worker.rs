//! The serve loop shared by every channel pool.
//!
//! Each pool owns exactly one worker task. Callers never touch the pool state: they push
//! [`Command`]s into the worker's queue, the worker matches pending lease requests to open
//! channels in rotation and re-admits recoverable channels once they come back.
use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::request_queue::RequestQueue;
use super::PoolStats;
use crate::transport::{Channel, ChannelId, CloseReason, LinkState};
use crate::Error;

type LeaseOutcome = Result<Channel, Error>;

pub(crate) enum Command {
    Lease(oneshot::Sender<LeaseOutcome>),
    Add(Vec<Channel>),
    Remove(Removal, oneshot::Sender<Vec<Channel>>),
    Stats(oneshot::Sender<PoolStats>),
    Recovered(ChannelId),
    Shutdown(ChannelId, CloseReason),
}

pub(crate) enum Removal {
    Channels(Vec<ChannelId>),
    Count(usize),
}

/// A handle to a running pool worker.
///
/// The worker stops, closing the channels it still holds, once every clone of the handle
/// has been dropped.
#[derive(Clone)]
pub(crate) struct PoolHandle {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    _stop: Arc<DropGuard>,
}

impl PoolHandle {
    /// Spawn the worker of the pool called `name`, seeded with `channels`.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(name: &str, channels: Vec<Channel>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let mut worker = Worker {
            name: name.into(),
            open: Vec::new(),
            cursor: 0,
            recovering: HashMap::new(),
            watchers: HashMap::new(),
            requests: RequestQueue::default(),
            commands: commands.clone(),
        };
        worker.add(channels);
        tokio::spawn(worker.run(receiver, stop.clone()));
        Self {
            name: name.into(),
            commands,
            _stop: Arc::new(stop.drop_guard()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn lease(&self, cancel: &CancellationToken) -> LeaseOutcome {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (request, outcome) = oneshot::channel();
        self.send(Command::Lease(request))?;
        tokio::select! {
            biased;
            // Dropping `outcome` withdraws the request from the queue.
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = outcome => outcome.unwrap_or(Err(Error::ShutDown("channel pool"))),
        }
    }

    pub(crate) fn add(&self, channels: Vec<Channel>) -> Result<(), Error> {
        self.send(Command::Add(channels))
    }

    pub(crate) async fn remove(&self, removal: Removal) -> Result<Vec<Channel>, Error> {
        let (reply, removed) = oneshot::channel();
        self.send(Command::Remove(removal, reply))?;
        removed.await.map_err(|_| Error::ShutDown("channel pool"))
    }

    pub(crate) async fn stats(&self) -> Result<PoolStats, Error> {
        let (reply, stats) = oneshot::channel();
        self.send(Command::Stats(reply))?;
        stats.await.map_err(|_| Error::ShutDown("channel pool"))
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.commands
            .send(command)
            .map_err(|_| Error::ShutDown("channel pool"))
    }
}

struct Worker {
    name: String,
    /// Channels leases are served from, in rotation.
    open: Vec<Channel>,
    /// The index of the next channel to hand out.
    cursor: usize,
    /// Recoverable channels that are closed, waiting for their recovery.
    recovering: HashMap<ChannelId, Channel>,
    /// Recoverable channels tracked by the pool, open or not, with the task observing them.
    watchers: HashMap<ChannelId, JoinHandle<()>>,
    requests: RequestQueue<LeaseOutcome>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, stop: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command);
        }
        self.dispose().await;
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Lease(request) => {
                if self.requests.push(request) {
                    self.serve();
                }
            }
            Command::Add(channels) => {
                self.add(channels);
                self.serve();
            }
            Command::Remove(removal, reply) => {
                let removed = self.remove(removal);
                let _ = reply.send(removed);
                // Pending leases may have been waiting on a removed channel.
                self.serve();
            }
            Command::Stats(reply) => {
                self.evict_closed();
                self.serve();
                let _ = reply.send(PoolStats {
                    open: self.open.len(),
                    recovering: self.recovering.len(),
                    pending: self.requests.len(),
                });
            }
            Command::Recovered(id) => {
                if let Some(channel) = self.recovering.remove(&id) {
                    info!(pool = %self.name, channel = %id, "Channel recovered, back in rotation");
                    self.open.push(channel);
                    self.serve();
                }
            }
            Command::Shutdown(id, reason) => {
                if reason.is_application_initiated() {
                    // It will not come back.
                    debug!(pool = %self.name, channel = %id, %reason, "Channel closed by the application");
                    self.untrack(id);
                    self.recovering.remove(&id);
                    self.take_open(id);
                } else if let Some(channel) = self.take_open(id) {
                    debug!(pool = %self.name, channel = %id, %reason, "Channel closed, waiting for its recovery");
                    self.recovering.insert(id, channel);
                }
                self.serve();
            }
        }
    }

    /// Hand out open channels to pending requests until the queue is drained
    /// or no open channel is left.
    fn serve(&mut self) {
        while !self.requests.is_empty() {
            if self.open.is_empty() {
                if self.recovering.is_empty() {
                    warn!(pool = %self.name, "No open channel and none can recover, failing pending leases");
                    let name = self.name.clone();
                    self.requests.resolve_all(|| {
                        Err(Error::ChannelAvailability(format!(
                            "pool `{name}` has no open channel and none of its channels can recover"
                        )))
                    });
                } else {
                    debug!(pool = %self.name, recovering = self.recovering.len(), "Waiting for a channel to recover");
                }
                return;
            }
            if self.cursor >= self.open.len() {
                self.cursor = 0;
            }
            if self.open[self.cursor].is_closed() {
                self.evict(self.cursor);
                continue;
            }
            let Some(request) = self.requests.pop() else {
                break;
            };
            let channel = self.open[self.cursor].clone();
            self.cursor += 1;
            // The caller may have given up in the meantime.
            let _ = request.send(Ok(channel));
        }
    }

    fn evict_closed(&mut self) {
        let mut index = 0;
        while index < self.open.len() {
            if self.open[index].is_closed() {
                self.evict(index);
            } else {
                index += 1;
            }
        }
    }

    /// Remove the closed channel at `index` from the rotation.
    fn evict(&mut self, index: usize) {
        let channel = self.open.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        let id = channel.id();
        match channel.close_reason() {
            Some(reason) if self.watchers.contains_key(&id) && !reason.is_application_initiated() => {
                debug!(pool = %self.name, channel = %id, %reason, "Channel closed, waiting for its recovery");
                self.recovering.insert(id, channel);
            }
            reason => {
                debug!(pool = %self.name, channel = %id, ?reason, "Evicting closed channel");
                self.untrack(id);
            }
        }
    }

    fn add(&mut self, channels: Vec<Channel>) {
        for channel in channels {
            let id = channel.id();
            if self.open.iter().any(|open| open.id() == id) {
                continue;
            }
            if let Some(channel) = self.recovering.remove(&id) {
                self.open.push(channel);
                continue;
            }
            if channel.supports_recovery() && !self.watchers.contains_key(&id) {
                let watcher = tokio::spawn(watch_channel(
                    id,
                    channel.subscribe(),
                    self.commands.clone(),
                ));
                self.watchers.insert(id, watcher);
            }
            debug!(pool = %self.name, channel = %id, "Channel added to the pool");
            self.open.push(channel);
        }
    }

    fn remove(&mut self, removal: Removal) -> Vec<Channel> {
        let removed: Vec<Channel> = match removal {
            Removal::Channels(ids) => ids
                .into_iter()
                .filter_map(|id| {
                    self.take_open(id)
                        .or_else(|| self.recovering.remove(&id))
                })
                .collect(),
            Removal::Count(count) => {
                let mut removed = Vec::with_capacity(count);
                while removed.len() < count {
                    let Some(channel) = self.open.pop() else {
                        break;
                    };
                    removed.push(channel);
                }
                let missing = count - removed.len();
                let ids: Vec<ChannelId> = self.recovering.keys().take(missing).copied().collect();
                removed.extend(ids.iter().filter_map(|id| self.recovering.remove(id)));
                removed
            }
        };
        if self.cursor >= self.open.len() {
            self.cursor = 0;
        }
        for channel in &removed {
            debug!(pool = %self.name, channel = %channel.id(), "Channel removed from the pool");
            self.untrack(channel.id());
        }
        removed
    }

    fn take_open(&mut self, id: ChannelId) -> Option<Channel> {
        let index = self.open.iter().position(|channel| channel.id() == id)?;
        let channel = self.open.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        Some(channel)
    }

    fn untrack(&mut self, id: ChannelId) {
        if let Some(watcher) = self.watchers.remove(&id) {
            watcher.abort();
        }
    }

    async fn dispose(mut self) {
        for (_, watcher) in self.watchers.drain() {
            watcher.abort();
        }
        self.requests
            .resolve_all(|| Err(Error::ShutDown("channel pool")));
        let channels: Vec<Channel> = self
            .open
            .drain(..)
            .chain(self.recovering.drain().map(|(_, channel)| channel))
            .collect();
        debug!(pool = %self.name, channels = channels.len(), "Shutting down, closing channels");
        for (channel, outcome) in channels
            .iter()
            .zip(join_all(channels.iter().map(|channel| channel.close())).await)
        {
            if let Err(e) = outcome {
                warn!(pool = %self.name, channel = %channel.id(), "Failed to close channel: {:?}", e);
            }
        }
    }
}

/// Forward the recoveries and closures of a recoverable channel to its pool's worker.
///
/// Transitions may be coalesced, so every observed state is forwarded: the worker ignores
/// the ones that do not change anything.
async fn watch_channel(
    id: ChannelId,
    mut state: watch::Receiver<LinkState>,
    commands: mpsc::UnboundedSender<Command>,
) {
    state.borrow_and_update();
    while state.changed().await.is_ok() {
        let command = match &*state.borrow_and_update() {
            LinkState::Open => Command::Recovered(id),
            LinkState::Closed(reason) => Command::Shutdown(id, reason.clone()),
        };
        if commands.send(command).is_err() {
            return;
        }
    }
}
