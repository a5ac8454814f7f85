//! Per-execution stream channels.
//!
//! Each channel keeps a bounded, time-limited backlog for late subscribers and
//! a `tokio::sync::broadcast` sender for live delivery, both sized by
//! `backlog_capacity`. Sequence numbers are assigned under the channel's own
//! lock, and the same lock covers the broadcast send, so every subscriber sees
//! envelopes in sequence order.
//!
//! Channels and their sequence counters live in this process only. The
//! dispatcher that admitted an execution is the one that runs it, so every
//! publisher and subscriber of a channel shares one `StreamManager`.
//!
//! A channel accepts exactly one terminal envelope (`done`, `cancelled` or
//! `error`). Repeats are no-ops and never reach subscribers.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::Stream;
use jobstream_types::config::StreamConfig;
use jobstream_types::stream::{StreamEnvelope, TerminalSignal};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Error text for executions whose worker stopped reporting.
pub const WORKER_LOST_ERROR: &str = "worker presumed lost";

/// Error text for a subscriber that fell further behind than the backlog holds.
pub fn overrun_error(missing_from: u64) -> String {
    format!("subscriber fell behind; messages from seq {missing_from} are no longer retained")
}

/// Errors from stream channel operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream channel {0} is closed")]
    ChannelClosed(Uuid),

    #[error("no stream channel for execution {0}")]
    UnknownChannel(Uuid),
}

/// Finite sequence of envelopes ending with the first control envelope.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = StreamEnvelope> + Send + 'static>>;

/// Retention and liveness limits applied to every channel.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub backlog_ttl: Duration,
    pub backlog_capacity: usize,
    pub idle_timeout: Duration,
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            backlog_ttl: Duration::from_secs(config.backlog_ttl_secs),
            backlog_capacity: config.backlog_capacity.max(1),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

struct Retained {
    at: Instant,
    envelope: StreamEnvelope,
}

struct ChannelState {
    next_seq: u64,
    backlog: VecDeque<Retained>,
    terminal: Option<StreamEnvelope>,
    /// Unset while the execution waits in the queue.
    last_activity: Option<Instant>,
    closed_at: Option<Instant>,
}

struct Channel {
    state: Mutex<ChannelState>,
    sender: broadcast::Sender<StreamEnvelope>,
    token: CancellationToken,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(ChannelState {
                next_seq: 1,
                backlog: VecDeque::new(),
                terminal: None,
                last_activity: None,
                closed_at: None,
            }),
            sender,
            token: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().expect("stream channel lock poisoned")
    }

    /// Envelopes after `after` still held for replay, ending with the
    /// terminal envelope when one exists.
    fn replay_after(&self, after: Option<u64>, ttl: Duration) -> Vec<StreamEnvelope> {
        let state = self.lock();
        replay_locked(&state, after, ttl)
    }
}

fn replay_locked(state: &ChannelState, after: Option<u64>, ttl: Duration) -> Vec<StreamEnvelope> {
    let now = Instant::now();
    let mut out: Vec<StreamEnvelope> = state
        .backlog
        .iter()
        .filter(|r| now.saturating_duration_since(r.at) <= ttl)
        .filter(|r| after.is_none_or(|seq| r.envelope.seq > seq))
        .map(|r| r.envelope.clone())
        .collect();

    if let Some(terminal) = &state.terminal {
        let already = out.last().is_some_and(|e| e.seq == terminal.seq);
        if !already && after.is_none_or(|seq| terminal.seq > seq) {
            out.push(terminal.clone());
        }
    }
    out
}

/// Registry of stream channels keyed by execution id.
pub struct StreamManager {
    channels: DashMap<Uuid, Arc<Channel>>,
    settings: StreamSettings,
}

impl StreamManager {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            channels: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Create the channel for `execution_id`, or return the existing one.
    pub fn open(&self, execution_id: Uuid) {
        self.channels
            .entry(execution_id)
            .or_insert_with(|| Arc::new(Channel::new(self.settings.backlog_capacity)));
    }

    /// Start the idle clock once a worker begins running the execution.
    pub fn mark_started(&self, execution_id: Uuid) {
        if let Ok(channel) = self.channel(execution_id) {
            channel.lock().last_activity = Some(Instant::now());
        }
    }

    pub fn contains(&self, execution_id: Uuid) -> bool {
        self.channels.contains_key(&execution_id)
    }

    fn channel(&self, execution_id: Uuid) -> Result<Arc<Channel>, StreamError> {
        self.channels
            .get(&execution_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or(StreamError::UnknownChannel(execution_id))
    }

    /// Append a data envelope. Returns its sequence number.
    pub fn publish(&self, execution_id: Uuid, body: impl Into<String>) -> Result<u64, StreamError> {
        let channel = self.channel(execution_id)?;
        let mut state = channel.lock();
        if state.terminal.is_some() {
            return Err(StreamError::ChannelClosed(execution_id));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let envelope = StreamEnvelope::data(seq, body);
        self.retain(&mut state, envelope.clone());
        // No receivers is fine; the backlog still holds the envelope.
        let _ = channel.sender.send(envelope);
        Ok(seq)
    }

    /// Publish the `done` terminal envelope. False if the channel already ended.
    pub fn complete(&self, execution_id: Uuid) -> Result<bool, StreamError> {
        self.terminate(execution_id, TerminalSignal::Completed)
    }

    /// Publish the `cancelled` terminal envelope and cancel the channel token.
    ///
    /// The token is cancelled even when the channel has already ended.
    pub fn cancel(&self, execution_id: Uuid) -> Result<bool, StreamError> {
        let channel = self.channel(execution_id)?;
        channel.token.cancel();
        self.terminate(execution_id, TerminalSignal::Cancelled)
    }

    /// Publish the `error` terminal envelope.
    pub fn fail(&self, execution_id: Uuid, error: impl Into<String>) -> Result<bool, StreamError> {
        self.terminate(execution_id, TerminalSignal::Failed(error.into()))
    }

    fn terminate(&self, execution_id: Uuid, signal: TerminalSignal) -> Result<bool, StreamError> {
        let channel = self.channel(execution_id)?;
        let mut state = channel.lock();
        if state.terminal.is_some() {
            tracing::debug!(%execution_id, ?signal, "ignoring repeated terminal signal");
            return Ok(false);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let envelope = StreamEnvelope::terminal(seq, &signal);
        state.terminal = Some(envelope.clone());
        state.closed_at = Some(Instant::now());
        self.retain(&mut state, envelope.clone());
        let _ = channel.sender.send(envelope);

        tracing::debug!(%execution_id, ?signal, seq, "stream channel terminated");
        Ok(true)
    }

    fn retain(&self, state: &mut ChannelState, envelope: StreamEnvelope) {
        let now = Instant::now();
        state.last_activity = Some(now);
        state.backlog.push_back(Retained { at: now, envelope });
        while state.backlog.len() > self.settings.backlog_capacity {
            state.backlog.pop_front();
        }
        while state
            .backlog
            .front()
            .is_some_and(|r| now.saturating_duration_since(r.at) > self.settings.backlog_ttl)
        {
            state.backlog.pop_front();
        }
    }

    /// The cancellation token handed to the runner for `execution_id`.
    pub fn cancellation_token(&self, execution_id: Uuid) -> Result<CancellationToken, StreamError> {
        Ok(self.channel(execution_id)?.token.clone())
    }

    /// The terminal envelope, once one has been published.
    pub fn terminal(&self, execution_id: Uuid) -> Result<Option<StreamEnvelope>, StreamError> {
        Ok(self.channel(execution_id)?.lock().terminal.clone())
    }

    /// Retained backlog followed by live envelopes, ending after the first
    /// control envelope.
    ///
    /// Delivered sequence numbers never skip. A subscriber that falls so far
    /// behind that the backlog no longer holds its next message gets a
    /// synthesized `error` envelope carrying that sequence number instead.
    pub fn subscribe(&self, execution_id: Uuid) -> Result<EnvelopeStream, StreamError> {
        let channel = self.channel(execution_id)?;
        let ttl = self.settings.backlog_ttl;

        // Snapshot and receiver are taken under the same lock so nothing
        // published in between is missed.
        let (backlog, mut rx, mut expected) = {
            let state = channel.lock();
            (
                replay_locked(&state, None, ttl),
                channel.sender.subscribe(),
                state.next_seq,
            )
        };

        let stream = async_stream::stream! {
            for envelope in backlog {
                let control = envelope.is_control();
                yield envelope;
                if control {
                    return;
                }
            }

            loop {
                let batch = match rx.recv().await {
                    Ok(envelope) => vec![envelope],
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%execution_id, skipped, "subscriber lagged, resyncing from backlog");
                        channel.replay_after(expected.checked_sub(1), ttl)
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                for envelope in batch {
                    if envelope.seq < expected {
                        continue;
                    }
                    if envelope.seq > expected {
                        tracing::warn!(
                            %execution_id,
                            missing_from = expected,
                            resumed_at = envelope.seq,
                            "subscriber overran the backlog"
                        );
                        let signal = TerminalSignal::Failed(overrun_error(expected));
                        yield StreamEnvelope::terminal(expected, &signal);
                        return;
                    }
                    expected += 1;
                    let control = envelope.is_control();
                    yield envelope;
                    if control {
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// Fail every started channel that has been silent for `idle_timeout`.
    /// Channels still waiting in the queue are never swept.
    pub fn sweep_idle(&self, now: Instant) -> Vec<Uuid> {
        let idle: Vec<Uuid> = self
            .channels
            .iter()
            .filter(|entry| {
                let state = entry.value().lock();
                state.terminal.is_none()
                    && state.last_activity.is_some_and(|at| {
                        now.saturating_duration_since(at) >= self.settings.idle_timeout
                    })
            })
            .map(|entry| *entry.key())
            .collect();

        let mut failed = Vec::with_capacity(idle.len());
        for execution_id in idle {
            if let Ok(true) = self.fail(execution_id, WORKER_LOST_ERROR) {
                // A stalled runner that is still alive must stop as well.
                if let Ok(token) = self.cancellation_token(execution_id) {
                    token.cancel();
                }
                tracing::warn!(%execution_id, "execution idle past timeout, failing stream");
                failed.push(execution_id);
            }
        }
        failed
    }

    /// Drop terminated channels whose backlog TTL has passed.
    pub fn sweep_retained(&self, now: Instant) -> usize {
        let ttl = self.settings.backlog_ttl;
        let before = self.channels.len();
        self.channels.retain(|_, channel| {
            let state = channel.lock();
            state
                .closed_at
                .is_none_or(|closed| now.saturating_duration_since(closed) < ttl)
        });
        before - self.channels.len()
    }

    /// Run both sweeps every `interval` until `shutdown` is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let failed = self.sweep_idle(now);
                    let dropped = self.sweep_retained(now);
                    if !failed.is_empty() || dropped > 0 {
                        tracing::info!(failed = failed.len(), dropped, "stream sweep");
                    }
                }
            }
        }
        tracing::debug!("stream sweeper stopped");
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new(StreamSettings::default())
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("channels", &self.channels.len())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use jobstream_types::stream::EnvelopeType;

    fn manager() -> StreamManager {
        StreamManager::default()
    }

    async fn drain(stream: EnvelopeStream) -> Vec<StreamEnvelope> {
        stream.collect().await
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let mgr = manager();
        let id = Uuid::now_v7();
        mgr.open(id);
        mgr.publish(id, "a").unwrap();
        mgr.open(id);
        mgr.complete(id).unwrap();

        let got = drain(mgr.subscribe(id).unwrap()).await;
        assert_eq!(got.len(), 2);
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn unknown_channel_errors() {
        let mgr = manager();
        let id = Uuid::now_v7();
        assert_eq!(mgr.subscribe(id).err(), Some(StreamError::UnknownChannel(id)));
        assert_eq!(mgr.publish(id, "x"), Err(StreamError::UnknownChannel(id)));
    }

    #[tokio::test]
    async fn publish_after_terminal_is_rejected() {
        let mgr = manager();
        let id = Uuid::now_v7();
        mgr.open(id);
        mgr.complete(id).unwrap();
        assert_eq!(mgr.publish(id, "late"), Err(StreamError::ChannelClosed(id)));
    }

    #[tokio::test]
    async fn complete_twice_delivers_one_terminal() {
        let mgr = manager();
        let id = Uuid::now_v7();
        mgr.open(id);
        let live = mgr.subscribe(id).unwrap();

        mgr.publish(id, "hello").unwrap();
        assert!(mgr.complete(id).unwrap());
        assert!(!mgr.complete(id).unwrap());
        assert!(!mgr.fail(id, "boom").unwrap());

        let got = drain(live).await;
        let controls: Vec<_> = got.iter().filter(|e| e.is_control()).collect();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].kind, EnvelopeType::Done);
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_same_terminal() {
        let mgr = manager();
        let id = Uuid::now_v7();
        mgr.open(id);
        let early = mgr.subscribe(id).unwrap();
        mgr.publish(id, "one").unwrap();
        let middle = mgr.subscribe(id).unwrap();
        mgr.fail(id, "runner crashed").unwrap();
        mgr.cancel(id).unwrap();
        let late = mgr.subscribe(id).unwrap();

        for stream in [early, middle, late] {
            let got = drain(stream).await;
            let last = got.last().unwrap();
            assert_eq!(last.kind, EnvelopeType::Error);
            assert_eq!(last.error.as_deref(), Some("runner crashed"));
            assert_eq!(got.iter().filter(|e| e.is_control()).count(), 1);
        }
    }

    #[tokio::test]
    async fn sequences_strictly_increase_without_gaps() {
        let mgr = manager();
        let id = Uuid::now_v7();
        mgr.open(id);
        mgr.publish(id, "0").unwrap();
        mgr.publish(id, "1").unwrap();
        let sub = mgr.subscribe(id).unwrap();
        for i in 2..20 {
            mgr.publish(id, i.to_string()).unwrap();
        }
        mgr.complete(id).unwrap();

        let seqs: Vec<u64> = drain(sub).await.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=21).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn late_subscriber_gets_backlog_then_live_then_done() {
        let mgr = Arc::new(manager());
        let id = Uuid::now_v7();
        mgr.open(id);
        for chunk in ["a", "b", "c"] {
            mgr.publish(id, chunk).unwrap();
        }

        let sub = mgr.subscribe(id).unwrap();
        let producer = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                mgr.publish(id, "d").unwrap();
                mgr.complete(id).unwrap();
            })
        };

        let got = drain(sub).await;
        producer.await.unwrap();

        let bodies: Vec<_> = got.iter().filter_map(|e| e.body.as_deref()).collect();
        assert_eq!(bodies, vec!["a", "b", "c", "d"]);
        assert_eq!(got.last().unwrap().kind, EnvelopeType::Done);
        assert_eq!(got.iter().filter(|e| e.is_control()).count(), 1);
    }

    #[tokio::test]
    async fn cancel_flips_token_and_closes_channel() {
        let mgr = manager();
        let id = Uuid::now_v7();
        mgr.open(id);
        let token = mgr.cancellation_token(id).unwrap();
        assert!(!token.is_cancelled());

        assert!(mgr.cancel(id).unwrap());
        assert!(token.is_cancelled());
        assert_eq!(mgr.terminal(id).unwrap().map(|e| e.kind), Some(EnvelopeType::Cancelled));
        assert_eq!(mgr.publish(id, "after"), Err(StreamError::ChannelClosed(id)));

        let got = drain(mgr.subscribe(id).unwrap()).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, EnvelopeType::Cancelled);
    }

    #[tokio::test]
    async fn backlog_capacity_keeps_newest() {
        let mgr = StreamManager::new(StreamSettings {
            backlog_capacity: 3,
            ..StreamSettings::default()
        });
        let id = Uuid::now_v7();
        mgr.open(id);
        for i in 0..5 {
            mgr.publish(id, i.to_string()).unwrap();
        }
        mgr.complete(id).unwrap();

        let got = drain(mgr.subscribe(id).unwrap()).await;
        let bodies: Vec<_> = got.iter().filter_map(|e| e.body.as_deref()).collect();
        assert_eq!(bodies, vec!["3", "4"]);
        assert_eq!(got.last().unwrap().kind, EnvelopeType::Done);
    }

    #[tokio::test]
    async fn lagging_subscriber_ends_with_overrun_instead_of_skipping() {
        let mgr = StreamManager::new(StreamSettings {
            backlog_capacity: 3,
            ..StreamSettings::default()
        });
        let id = Uuid::now_v7();
        mgr.open(id);
        let slow = mgr.subscribe(id).unwrap();
        for i in 0..20 {
            mgr.publish(id, i.to_string()).unwrap();
        }
        mgr.complete(id).unwrap();

        let got = drain(slow).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, EnvelopeType::Error);
        assert_eq!(got[0].seq, 1);
        assert_eq!(got[0].error.as_deref(), Some(overrun_error(1).as_str()));

        // The channel itself still ended cleanly.
        assert_eq!(mgr.terminal(id).unwrap().map(|e| e.kind), Some(EnvelopeType::Done));
    }

    #[tokio::test]
    async fn lag_after_partial_read_keeps_delivered_prefix() {
        let mgr = StreamManager::new(StreamSettings {
            backlog_capacity: 4,
            ..StreamSettings::default()
        });
        let id = Uuid::now_v7();
        mgr.open(id);
        let mut sub = mgr.subscribe(id).unwrap();
        mgr.publish(id, "a").unwrap();
        mgr.publish(id, "b").unwrap();
        assert_eq!(sub.next().await.unwrap().seq, 1);
        assert_eq!(sub.next().await.unwrap().seq, 2);

        for i in 0..10 {
            mgr.publish(id, i.to_string()).unwrap();
        }
        mgr.complete(id).unwrap();

        let rest = drain(sub).await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].kind, EnvelopeType::Error);
        assert_eq!(rest[0].seq, 3);
    }

    #[tokio::test]
    async fn subscriber_within_capacity_sees_every_sequence() {
        let mgr = StreamManager::new(StreamSettings {
            backlog_capacity: 8,
            ..StreamSettings::default()
        });
        let id = Uuid::now_v7();
        mgr.open(id);
        let sub = mgr.subscribe(id).unwrap();
        for i in 0..7 {
            mgr.publish(id, i.to_string()).unwrap();
        }
        mgr.complete(id).unwrap();

        let seqs: Vec<u64> = drain(sub).await.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn idle_sweep_fails_silent_channels_only() {
        let mgr = StreamManager::new(StreamSettings {
            idle_timeout: Duration::from_secs(60),
            ..StreamSettings::default()
        });
        let idle = Uuid::now_v7();
        let finished = Uuid::now_v7();
        let queued = Uuid::now_v7();
        mgr.open(idle);
        mgr.mark_started(idle);
        mgr.open(finished);
        mgr.complete(finished).unwrap();
        mgr.open(queued);

        assert!(mgr.sweep_idle(Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(mgr.sweep_idle(later), vec![idle]);
        assert!(mgr.cancellation_token(idle).unwrap().is_cancelled());
        assert!(!mgr.cancellation_token(finished).unwrap().is_cancelled());
        assert!(mgr.terminal(queued).unwrap().is_none());

        let got = drain(mgr.subscribe(idle).unwrap()).await;
        assert_eq!(got[0].kind, EnvelopeType::Error);
        assert_eq!(got[0].error.as_deref(), Some(WORKER_LOST_ERROR));
    }

    #[tokio::test]
    async fn retained_sweep_drops_expired_terminal_channels() {
        let mgr = StreamManager::new(StreamSettings {
            backlog_ttl: Duration::from_secs(30),
            ..StreamSettings::default()
        });
        let open = Uuid::now_v7();
        let done = Uuid::now_v7();
        mgr.open(open);
        mgr.open(done);
        mgr.complete(done).unwrap();

        assert_eq!(mgr.sweep_retained(Instant::now()), 0);
        assert_eq!(mgr.sweep_retained(Instant::now() + Duration::from_secs(31)), 1);
        assert!(mgr.contains(open));
        assert!(!mgr.contains(done));
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let mgr = Arc::new(manager());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&mgr).run_sweeper(Duration::from_millis(10), shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
