use crate::auth::{AuthGate, Exchange};
use crate::batch::{self, BatchPlan, RegisterBatch};
use crate::config::InverterConfig;
use crate::error::{CodecError, Error, ProtocolException, Result, TransportError};
use crate::failed::{self, FailedRegisterCache};
use crate::learner::{self, LearnedTimeout, TimeoutLearner};
use crate::link::Link;
use crate::pdu::{self, Decoded, FunctionCode};
use crate::registers::{RegisterDescriptor, RegisterTable, Value};
use crate::store::StateStore;
use crate::timing::{OpKind, Stats, TimingCollector, millis};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const REQUEST_QUEUE_DEPTH: usize = 32;
const UPDATE_CHANNEL_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Polling,
    Reconnecting,
    Disconnecting,
}

/// Last known value of a register as seen by a caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Reading {
    /// Read successfully in the most recent cycle.
    Fresh(Value),
    /// The most recent read failed; this is the previous value.
    Stale(Value),
    Unavailable,
}

impl Reading {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Reading::Fresh(v) | Reading::Stale(v) => Some(v),
            Reading::Unavailable => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    pub batches: usize,
    pub fresh: usize,
    pub stale: usize,
    pub newly_failed: Vec<u16>,
    pub reconnects: u32,
}

/// Pushed to subscribers after every poll cycle and confirmed write.
#[derive(Debug, Clone, PartialEq)]
pub enum PollUpdate {
    CycleComplete(CycleReport),
    Written { address: u16, value: Value },
}

/// Snapshot for monitoring consumers.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub state: ConnectionState,
    pub connected: bool,
    pub session_id: u64,
    /// Share of successful exchanges in the timing window, `None` before the first one.
    pub connection_quality: Option<f64>,
    pub stats: BTreeMap<OpKind, Stats>,
    pub failed_registers: Vec<u16>,
    pub learned_timeouts: BTreeMap<OpKind, LearnedTimeout>,
    pub connect_failures: u32,
    pub cycles: u64,
    pub last_cycle: Option<CycleReport>,
    pub values: BTreeMap<String, Reading>,
}

enum Request {
    Read {
        address: u16,
        reply: oneshot::Sender<Result<Reading>>,
    },
    ReadAll {
        reply: oneshot::Sender<BTreeMap<u16, Reading>>,
    },
    Write {
        address: u16,
        value: Value,
        reply: oneshot::Sender<Result<()>>,
    },
    Refresh {
        reply: oneshot::Sender<Result<CycleReport>>,
    },
    Diagnostics {
        reply: oneshot::Sender<Diagnostics>,
    },
    ClearFailed {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable front end; requests are served one at a time in submission order.
#[derive(Clone)]
pub struct InverterHandle {
    requests: mpsc::Sender<Request>,
    updates: broadcast::Sender<PollUpdate>,
}

impl InverterHandle {
    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(request(reply))
            .await
            .map_err(|_| Error::Stopped)?;
        response.await.map_err(|_| Error::Stopped)
    }

    pub async fn read(&self, address: u16) -> Result<Reading> {
        self.call(|reply| Request::Read { address, reply }).await?
    }

    pub async fn read_all(&self) -> Result<BTreeMap<u16, Reading>> {
        self.call(|reply| Request::ReadAll { reply }).await
    }

    pub async fn write(&self, address: u16, value: Value) -> Result<()> {
        self.call(|reply| Request::Write {
            address,
            value,
            reply,
        })
        .await?
    }

    /// Run a poll cycle now instead of waiting for the next tick.
    pub async fn force_refresh(&self) -> Result<CycleReport> {
        self.call(|reply| Request::Refresh { reply }).await?
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        self.call(|reply| Request::Diagnostics { reply }).await
    }

    /// Forget every register marked unsupported; returns how many were cleared.
    pub async fn clear_failed_registers(&self) -> Result<usize> {
        self.call(|reply| Request::ClearFailed { reply }).await
    }

    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<PollUpdate> {
        self.updates.subscribe()
    }
}

#[derive(Debug, Clone)]
struct CachedValue {
    value: Value,
    fresh: bool,
}

enum BatchOutcome {
    Values(Vec<u16>),
    /// The device refused at least one address in the batch.
    Rejected,
    Unavailable(ReadFailure),
}

enum ReadFailure {
    Exception(ProtocolException),
    Transport(TransportError),
}

impl From<ReadFailure> for Error {
    fn from(failure: ReadFailure) -> Self {
        match failure {
            ReadFailure::Exception(e) => Error::Protocol(e),
            ReadFailure::Transport(e) => Error::Transport(e),
        }
    }
}

impl std::fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadFailure::Exception(e) => write!(f, "{e}"),
            ReadFailure::Transport(e) => write!(f, "{e}"),
        }
    }
}

/// Exchanges within the current transport session, timed by the learner.
struct Session<'a, L> {
    transport: &'a mut Transport<L>,
    learner: &'a TimeoutLearner,
}

impl<L: Link> Exchange for Session<'_, L> {
    fn session_id(&self) -> u64 {
        self.transport.session_id()
    }

    async fn exchange(
        &mut self,
        request: &[u8],
        op: OpKind,
    ) -> std::result::Result<Decoded, TransportError> {
        let timeout = self.learner.timeout_for(op);
        self.transport.send_and_wait(request, op, timeout).await
    }
}

/// Owns the connection and every piece of mutable protocol state.
///
/// Runs as a single task: poll ticks and queued requests are handled one at a
/// time, so nothing here needs locking.
pub struct Coordinator<L> {
    config: InverterConfig,
    table: RegisterTable,
    transport: Transport<L>,
    learner: TimeoutLearner,
    auth: AuthGate,
    failed: FailedRegisterCache,
    plan: Option<(u64, BatchPlan)>,
    cache: HashMap<u16, CachedValue>,
    store: Arc<dyn StateStore>,
    state: ConnectionState,
    connect_failures: u32,
    cycles: u64,
    last_cycle: Option<CycleReport>,
    requests: mpsc::Receiver<Request>,
    updates: broadcast::Sender<PollUpdate>,
    cancel: CancellationToken,
}

impl<L: Link + 'static> Coordinator<L> {
    pub fn new(
        config: InverterConfig,
        table: RegisterTable,
        link: L,
        store: Arc<dyn StateStore>,
        cancel: CancellationToken,
    ) -> (Self, InverterHandle) {
        let ranges = config.effective_protected_ranges();
        let table = table.with_protection(&ranges);

        let defaults = OpKind::ALL
            .iter()
            .map(|&op| (op, config.default_timeout(op)))
            .collect();
        let mut learner = TimeoutLearner::new(config.learner.clone(), defaults);
        learner.restore(learner::load(store.as_ref()));
        let failed = failed::load(store.as_ref());
        if !failed.is_empty() {
            tracing::info!("Restored {} unsupported registers", failed.len());
        }

        let transport = Transport::new(
            link,
            config.min_spacing(),
            config.max_consecutive_timeouts,
            TimingCollector::new(config.timing_window),
            cancel.clone(),
        );

        let (request_tx, requests) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_DEPTH);
        let handle = InverterHandle {
            requests: request_tx,
            updates: updates.clone(),
        };

        let coordinator = Self {
            auth: AuthGate::new(ranges),
            config,
            table,
            transport,
            learner,
            failed,
            plan: None,
            cache: HashMap::new(),
            store,
            state: ConnectionState::Idle,
            connect_failures: 0,
            cycles: 0,
            last_cycle: None,
            requests,
            updates,
            cancel,
        };
        (coordinator, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let persist_every = self.config.persist_interval().max(Duration::from_secs(1));
        let mut persist = tokio::time::interval_at(Instant::now() + persist_every, persist_every);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(request) = self.requests.recv() => self.handle(request).await,
                _ = poll.tick() => {
                    if let Err(e) = self.poll_cycle().await {
                        tracing::warn!("Poll cycle failed: {}", e);
                    }
                }
                _ = persist.tick() => self.persist(),
            }
        }

        self.shutdown().await;
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Read { address, reply } => {
                let _ = reply.send(self.read(address));
            }
            Request::ReadAll { reply } => {
                let _ = reply.send(self.read_all());
            }
            Request::Write {
                address,
                value,
                reply,
            } => {
                if reply.is_closed() {
                    tracing::debug!("Write to {:04X}h abandoned before sending", address);
                    return;
                }
                let _ = reply.send(self.write(address, value).await);
            }
            Request::Refresh { reply } => {
                if reply.is_closed() {
                    return;
                }
                let _ = reply.send(self.poll_cycle().await);
            }
            Request::Diagnostics { reply } => {
                let _ = reply.send(self.diagnostics());
            }
            Request::ClearFailed { reply } => {
                let _ = reply.send(self.clear_failed_registers());
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn read(&self, address: u16) -> Result<Reading> {
        if self.table.get(address).is_none() {
            return Err(Error::UnknownRegister(address));
        }
        Ok(self.reading(address))
    }

    fn reading(&self, address: u16) -> Reading {
        if self.failed.contains(address) {
            return Reading::Unavailable;
        }
        match self.cache.get(&address) {
            Some(CachedValue { value, fresh: true }) => Reading::Fresh(value.clone()),
            Some(CachedValue { value, fresh: false }) => Reading::Stale(value.clone()),
            None => Reading::Unavailable,
        }
    }

    pub fn read_all(&self) -> BTreeMap<u16, Reading> {
        self.table
            .iter()
            .map(|d| (d.address, self.reading(d.address)))
            .collect()
    }

    fn current_plan(&mut self) -> BatchPlan {
        let generation = self.failed.generation();
        match &self.plan {
            Some((built_for, plan)) if *built_for == generation => plan.clone(),
            _ => {
                let plan = batch::plan(self.table.iter(), self.config.max_batch_size, &self.failed);
                self.plan = Some((generation, plan.clone()));
                plan
            }
        }
    }

    /// Read every planned batch once.
    ///
    /// Read failures leave the affected values stale and the cycle continues. A
    /// lost connection suspends the cycle, reconnects, and resumes with the
    /// interrupted batch.
    pub async fn poll_cycle(&mut self) -> Result<CycleReport> {
        self.ensure_connected().await?;
        self.state = ConnectionState::Polling;

        let started = Instant::now();
        let mut report = CycleReport {
            started_at: Utc::now(),
            duration: Duration::ZERO,
            batches: 0,
            fresh: 0,
            stale: 0,
            newly_failed: Vec::new(),
            reconnects: 0,
        };
        let mut queue: VecDeque<RegisterBatch> = self.current_plan().batches.into();

        while let Some(batch) = queue.pop_front() {
            match self.read_batch(&batch).await {
                Ok(BatchOutcome::Values(words)) => {
                    report.batches += 1;
                    report.fresh += self.store_values(&batch, &words);
                }
                Ok(BatchOutcome::Rejected) => match batch.split() {
                    Some((head, tail)) => {
                        tracing::debug!(
                            "Batch {:04X}h+{} rejected, isolating",
                            batch.start,
                            batch.count
                        );
                        queue.push_front(tail);
                        queue.push_front(head);
                    }
                    None => {
                        report.batches += 1;
                        if self.failed.insert(batch.start) {
                            report.newly_failed.push(batch.start);
                        }
                        self.cache.remove(&batch.start);
                    }
                },
                Ok(BatchOutcome::Unavailable(failure)) => {
                    tracing::warn!(
                        "Registers {:04X}h-{:04X}h unavailable this cycle: {}",
                        batch.start,
                        batch.end(),
                        failure
                    );
                    report.batches += 1;
                    report.stale += self.mark_stale(&batch);
                }
                Err(Error::Transport(e)) if e.is_connection_loss() => {
                    report.reconnects += 1;
                    if report.reconnects > self.config.reconnect.max_attempts {
                        self.abandon_cycle(&batch, &queue);
                        return Err(e.into());
                    }
                    tracing::warn!(
                        "Link lost at batch {:04X}h: {}; {} batches pending",
                        batch.start,
                        e,
                        queue.len() + 1
                    );
                    self.state = ConnectionState::Reconnecting;
                    if let Err(e) = self.ensure_connected().await {
                        self.abandon_cycle(&batch, &queue);
                        return Err(e);
                    }
                    self.state = ConnectionState::Polling;
                    queue.push_front(batch);
                }
                Err(e) => {
                    self.abandon_cycle(&batch, &queue);
                    return Err(e);
                }
            }
        }

        self.learner.update(self.transport.timing());
        report.duration = started.elapsed();
        self.cycles += 1;
        tracing::info!(
            "Cycle {}: {} fresh, {} stale, {} batches in {:?}",
            self.cycles,
            report.fresh,
            report.stale,
            report.batches,
            report.duration
        );
        self.last_cycle = Some(report.clone());
        let _ = self.updates.send(PollUpdate::CycleComplete(report.clone()));
        Ok(report)
    }

    fn abandon_cycle(&mut self, current: &RegisterBatch, pending: &VecDeque<RegisterBatch>) {
        self.mark_stale(current);
        for batch in pending {
            self.mark_stale(batch);
        }
    }

    /// Read one batch, retrying timeouts and garbled frames per the retry policy.
    async fn read_batch(&mut self, batch: &RegisterBatch) -> Result<BatchOutcome> {
        let request = pdu::encode_read(self.config.unit_id, batch.start, batch.count);
        let attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let timeout = self.learner.timeout_for(OpKind::ReadRegister);
            let failure: TransportError = match self
                .transport
                .send_and_wait(&request, OpKind::ReadRegister, timeout)
                .await
            {
                Ok(Decoded::Data(response))
                    if response.unit_id == self.config.unit_id
                        && response.function_code == FunctionCode::ReadHoldingRegisters =>
                {
                    match response.register_values() {
                        Ok(words) if words.len() == usize::from(batch.count) => {
                            return Ok(BatchOutcome::Values(words));
                        }
                        // Most likely the late answer to an earlier request.
                        Ok(words) => {
                            tracing::debug!(
                                "Discarding {}-word response to {}-word read at {:04X}h",
                                words.len(),
                                batch.count,
                                batch.start
                            );
                            CodecError::Mismatch.into()
                        }
                        Err(e) => e.into(),
                    }
                }
                Ok(Decoded::Data(_)) => CodecError::Mismatch.into(),
                Ok(Decoded::Exception {
                    unit_id,
                    function_code,
                    ..
                }) if unit_id != self.config.unit_id
                    || function_code != FunctionCode::ReadHoldingRegisters as u8 =>
                {
                    CodecError::Mismatch.into()
                }
                Ok(Decoded::Exception {
                    exception: ProtocolException::IllegalAddress,
                    ..
                })
                | Err(TransportError::Codec(CodecError::Rejected)) => {
                    return Ok(BatchOutcome::Rejected);
                }
                // Reads are never protected; nothing to retry or cache.
                Ok(Decoded::Exception { exception, .. }) => {
                    return Ok(BatchOutcome::Unavailable(ReadFailure::Exception(exception)));
                }
                Err(TransportError::Cancelled) => return Err(Error::Stopped),
                Err(e) if e.is_connection_loss() => return Err(e.into()),
                Err(e) => e,
            };

            if attempt >= attempts {
                return Ok(BatchOutcome::Unavailable(ReadFailure::Transport(failure)));
            }
            tracing::debug!(
                "Read {:04X}h attempt {}/{} failed: {}",
                batch.start,
                attempt,
                attempts,
                failure
            );
            attempt += 1;
            self.pause(self.config.retry.delay()).await?;
        }
    }

    async fn pause(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Stopped),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn store_values(&mut self, batch: &RegisterBatch, words: &[u16]) -> usize {
        let mut stored = 0;
        for &address in &batch.registers {
            let Some(descriptor) = self.table.get(address) else {
                continue;
            };
            let offset = usize::from(address - batch.start);
            let Some(value) = words.get(offset..).and_then(|w| descriptor.decode(w)) else {
                continue;
            };
            self.cache.insert(address, CachedValue { value, fresh: true });
            stored += 1;
        }
        stored
    }

    fn mark_stale(&mut self, batch: &RegisterBatch) -> usize {
        let mut stale = 0;
        for address in &batch.registers {
            if let Some(cached) = self.cache.get_mut(address) {
                cached.fresh = false;
                stale += 1;
            }
        }
        stale
    }

    /// Validate, write, and confirm by reading the register back.
    ///
    /// Never retried: a repeated write could repeat a physical side effect.
    pub async fn write(&mut self, address: u16, value: Value) -> Result<()> {
        let descriptor: RegisterDescriptor = self
            .table
            .get(address)
            .ok_or(Error::UnknownRegister(address))?
            .clone();
        let words = descriptor
            .encode(&value)
            .map_err(|reason| Error::Validation { address, reason })?;

        self.ensure_connected().await?;
        tracing::info!("Writing {} = {} ({:04X?})", descriptor.name, value, words);

        let mut session = Session {
            transport: &mut self.transport,
            learner: &self.learner,
        };
        self.auth
            .guard_write(&mut session, self.config.unit_id, address, &words)
            .await?;

        self.pause(self.config.verify_delay()).await?;
        let readback = RegisterBatch {
            start: address,
            count: descriptor.words(),
            registers: vec![address],
        };
        let read_back = match self.read_batch(&readback).await? {
            BatchOutcome::Values(read_back) => read_back,
            BatchOutcome::Rejected => {
                return Err(ProtocolException::IllegalAddress.into());
            }
            BatchOutcome::Unavailable(failure) => return Err(failure.into()),
        };
        if read_back != words {
            tracing::warn!(
                "Write to {:04X}h not confirmed: wrote {:04X?}, read {:04X?}",
                address,
                words,
                read_back
            );
            return Err(Error::WriteVerification {
                address,
                written: words,
                read_back,
            });
        }

        if let Some(confirmed) = descriptor.decode(&read_back) {
            self.cache.insert(
                address,
                CachedValue {
                    value: confirmed.clone(),
                    fresh: true,
                },
            );
            let _ = self.updates.send(PollUpdate::Written {
                address,
                value: confirmed,
            });
        }
        Ok(())
    }

    /// Connect if needed, backing off exponentially between failed attempts.
    async fn ensure_connected(&mut self) -> Result<()> {
        if self.transport.is_connected() {
            return Ok(());
        }
        let policy = self.config.reconnect.clone();
        let max_attempts = policy.max_attempts.max(1);
        let mut backoff = policy.initial_backoff();

        for attempt in 1..=max_attempts {
            if self.state != ConnectionState::Reconnecting {
                self.state = ConnectionState::Connecting;
            }
            let timeout = self.config.default_timeout(OpKind::Connect);
            match self.transport.connect(timeout).await {
                Ok(()) => {
                    self.connect_failures = 0;
                    return Ok(());
                }
                Err(TransportError::Cancelled) => return Err(Error::Stopped),
                Err(e) if attempt == max_attempts => {
                    self.connect_failures += 1;
                    self.state = ConnectionState::Idle;
                    tracing::error!("Giving up after {} connection attempts: {}", attempt, e);
                    return Err(Error::Connection {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    self.connect_failures += 1;
                    self.state = ConnectionState::Reconnecting;
                    tracing::warn!(
                        "Connection attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        max_attempts,
                        e,
                        backoff
                    );
                    self.pause(backoff).await?;
                    backoff = backoff.saturating_mul(2).min(policy.max_backoff());
                }
            }
        }
        Err(Error::Connection {
            attempts: max_attempts,
            reason: "no attempt made".into(),
        })
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let stats = self.transport.timing().all_stats();
        let (ok, total) = stats.values().fold((0usize, 0usize), |(ok, total), s| {
            (ok + s.success_count, total + s.sample_count)
        });
        let values = self
            .table
            .iter()
            .map(|d| (d.name.clone(), self.reading(d.address)))
            .collect();

        Diagnostics {
            state: self.state,
            connected: self.transport.is_connected(),
            session_id: self.transport.session_id(),
            connection_quality: (total > 0).then(|| ok as f64 / total as f64),
            stats,
            failed_registers: self.failed.iter().collect(),
            learned_timeouts: self.learner.learned().clone(),
            connect_failures: self.connect_failures,
            cycles: self.cycles,
            last_cycle: self.last_cycle.clone(),
            values,
        }
    }

    /// Forget unsupported registers, e.g. after a firmware change.
    ///
    /// Read timings gathered under the old register set are discarded too.
    pub fn clear_failed_registers(&mut self) -> usize {
        let cleared = self.failed.len();
        self.failed.clear();
        self.transport.timing_mut().clear(OpKind::ReadRegister);
        self.persist();
        cleared
    }

    fn persist(&self) {
        let store = self.store.as_ref();
        let result = learner::save(store, self.learner.learned())
            .and_then(|()| failed::save(store, &self.failed));
        match result {
            Ok(()) => tracing::debug!(
                "Persisted {} learned timeouts, {} failed registers",
                self.learner.learned().len(),
                self.failed.len()
            ),
            Err(e) => tracing::warn!("Failed to persist state: {}", e),
        }
    }

    pub async fn shutdown(&mut self) {
        self.state = ConnectionState::Disconnecting;
        self.learner.update(self.transport.timing());
        self.persist();
        self.auth.revoke_all();
        self.transport.disconnect().await;
        self.state = ConnectionState::Idle;
        tracing::info!("Coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::AuthenticationError;
    use crate::mock_link::{MockInverter, MockLink, RejectStyle};
    use crate::store::{MemoryStore, read_state};

    fn config() -> InverterConfig {
        InverterConfig {
            min_spacing_ms: 10,
            verify_delay_ms: 10,
            ..InverterConfig::default()
        }
    }

    fn table(addresses: &[u16]) -> RegisterTable {
        RegisterTable::new(
            addresses
                .iter()
                .map(|&a| RegisterDescriptor::new(a, &format!("r{a:04x}")))
                .collect(),
        )
        .unwrap()
    }

    /// A plain reading plus the writable output-priority setting.
    fn soc_and_priority() -> RegisterTable {
        let priority = RegisterTable::hf_series().get(0xE204).unwrap().clone();
        RegisterTable::new(vec![RegisterDescriptor::new(0x0100, "soc"), priority]).unwrap()
    }

    fn coordinator(
        device: &MockInverter,
        config: InverterConfig,
        table: RegisterTable,
    ) -> (Coordinator<MockLink>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let (coordinator, _handle) = Coordinator::new(
            config,
            table,
            device.link(),
            store.clone(),
            CancellationToken::new(),
        );
        (coordinator, store)
    }

    #[tokio::test(start_paused = true)]
    async fn poll_cycle_decodes_scaled_values() {
        let device = MockInverter::new();
        device.set_register(0x0107, 245);
        device.set_register(0x0102, (-52i16) as u16);
        let (mut coordinator, _) = coordinator(&device, config(), RegisterTable::hf_series());

        let report = coordinator.poll_cycle().await.unwrap();
        assert!(report.fresh > 0);
        assert_eq!(
            coordinator.read(0x0107).unwrap(),
            Reading::Fresh(Value::Number(24.5))
        );
        assert_eq!(
            coordinator.read(0x0102).unwrap(),
            Reading::Fresh(Value::Number(-5.2))
        );
        assert!(matches!(
            coordinator.read(0x9999),
            Err(Error::UnknownRegister(0x9999))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn illegal_address_is_excluded_from_later_cycles() {
        let device = MockInverter::new();
        device.mark_unsupported(0x0102);
        let (mut coordinator, store) =
            coordinator(&device, config(), table(&[0x0100, 0x0101, 0x0102, 0x0103]));

        let report = coordinator.poll_cycle().await.unwrap();
        assert_eq!(report.newly_failed, vec![0x0102]);
        assert_eq!(coordinator.read(0x0102).unwrap(), Reading::Unavailable);
        assert!(matches!(coordinator.read(0x0101).unwrap(), Reading::Fresh(_)));

        for _ in 0..3 {
            device.clear_requests();
            let report = coordinator.poll_cycle().await.unwrap();
            assert!(report.newly_failed.is_empty());
            assert!(!device.reads().contains(&0x0102));
            let plan = coordinator.current_plan();
            assert!(!plan.contains(0x0102));
        }

        coordinator.persist();
        assert!(read_state(store.as_ref()).failed_registers.contains(&0x0102));

        assert_eq!(coordinator.clear_failed_registers(), 1);
        assert!(coordinator.current_plan().contains(0x0102));
    }

    #[tokio::test(start_paused = true)]
    async fn dash_rejection_isolates_bad_register() {
        let device = MockInverter::new();
        device.set_reject_style(RejectStyle::Dash);
        device.mark_unsupported(0x0105);
        let (mut coordinator, _) =
            coordinator(&device, config(), table(&[0x0104, 0x0105, 0x0106, 0x0107]));

        let report = coordinator.poll_cycle().await.unwrap();
        assert_eq!(report.newly_failed, vec![0x0105]);
        for address in [0x0104, 0x0106, 0x0107] {
            assert!(matches!(coordinator.read(address).unwrap(), Reading::Fresh(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_resumes_interrupted_batch() {
        let device = MockInverter::new();
        let config = InverterConfig {
            max_batch_size: 2,
            ..config()
        };
        let (mut coordinator, _) = coordinator(
            &device,
            config,
            table(&[0x0100, 0x0101, 0x0200, 0x0201, 0x0300, 0x0301, 0x0400]),
        );

        // Two batches succeed, then the link drops as the third goes out.
        device.drop_after(2);
        let report = coordinator.poll_cycle().await.unwrap();

        assert_eq!(report.reconnects, 1);
        assert_eq!(device.opens(), 2);
        assert_eq!(
            device.reads(),
            vec![0x0100, 0x0200, 0x0300, 0x0300, 0x0400]
        );
        assert_eq!(report.fresh, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_leave_previous_value_stale() {
        let device = MockInverter::new();
        device.set_register(0x0100, 80);
        let config = InverterConfig {
            max_batch_size: 1,
            ..config()
        };
        let (mut coordinator, _) = coordinator(&device, config, table(&[0x0100, 0x0101]));
        coordinator.poll_cycle().await.unwrap();

        device.silence(0x0100);
        let report = coordinator.poll_cycle().await.unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(
            coordinator.read(0x0100).unwrap(),
            Reading::Stale(Value::Number(80.0))
        );
        assert!(matches!(coordinator.read(0x0101).unwrap(), Reading::Fresh(_)));
        assert_eq!(device.reads().iter().filter(|&&a| a == 0x0100).count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_is_not_stored_under_next_batch() {
        let device = MockInverter::new();
        device.set_register(0x0100, 111);
        device.set_register(0x0200, 222);
        device.set_latency(Duration::from_millis(600));
        let config = InverterConfig {
            read_timeout_ms: 500,
            retry: RetryPolicy {
                max_attempts: 1,
                delay_ms: 0,
            },
            ..config()
        };
        let (mut coordinator, _) =
            coordinator(&device, config, table(&[0x0100, 0x0101, 0x0102, 0x0200]));

        // The 0x0100 reply lands while the 0x0200 read is waiting.
        coordinator.poll_cycle().await.unwrap();
        assert_eq!(device.reads(), vec![0x0100, 0x0200]);
        assert_eq!(coordinator.read(0x0200).unwrap(), Reading::Unavailable);

        tokio::time::sleep(Duration::from_secs(1)).await;
        device.set_latency(Duration::ZERO);
        coordinator.poll_cycle().await.unwrap();
        assert_eq!(
            coordinator.read(0x0200).unwrap(),
            Reading::Fresh(Value::Number(222.0))
        );
        assert_eq!(
            coordinator.read(0x0100).unwrap(),
            Reading::Fresh(Value::Number(111.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connection_failures_escalate_after_ceiling() {
        let device = MockInverter::new();
        device.fail_opens(10);
        let (mut coordinator, _) = coordinator(&device, config(), table(&[0x0100]));

        let started = Instant::now();
        let err = coordinator.poll_cycle().await.unwrap_err();
        assert!(matches!(err, Error::Connection { attempts: 5, .. }));
        assert_eq!(device.opens(), 5);
        // 1 + 2 + 4 + 8 seconds of backoff between five attempts.
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(coordinator.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn protected_write_is_authorized_and_verified() {
        let device = MockInverter::new();
        let (mut coordinator, _) = coordinator(&device, config(), RegisterTable::hf_series());

        coordinator
            .write(0xE009, Value::Number(57.6))
            .await
            .unwrap();
        assert_eq!(device.register(0xE009), Some(576));

        let log = device.request_log();
        assert_eq!(log[0], (0x06, 0xE203));
        assert_eq!(log[1], (0x06, 0xE009));
        assert_eq!(log[2], (0x03, 0xE009));
        assert_eq!(
            coordinator.read(0xE009).unwrap(),
            Reading::Fresh(Value::Number(57.6))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_password_sends_no_write() {
        let device = MockInverter::new();
        device.set_password(9999);
        let mut config = config();
        config.protected_ranges[0].passwords = vec![4321];
        let (mut coordinator, _) = coordinator(&device, config, RegisterTable::hf_series());

        let err = coordinator
            .write(0xE009, Value::Number(57.6))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Authentication(AuthenticationError::Rejected { .. })
        ));
        assert_eq!(device.request_log(), vec![(0x06, 0xE203)]);
        assert_eq!(device.register(0xE009), None);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_password_is_the_only_candidate() {
        let device = MockInverter::new();
        let config = InverterConfig {
            password: Some(1111),
            ..config()
        };
        let (mut coordinator, _) = coordinator(&device, config, RegisterTable::hf_series());

        let err = coordinator
            .write(0xE009, Value::Number(57.6))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Authentication(AuthenticationError::Rejected { .. })
        ));
        assert_eq!(device.request_log(), vec![(0x06, 0xE203)]);
        assert_eq!(device.register(0xE009), None);
    }

    #[tokio::test(start_paused = true)]
    async fn readback_mismatch_is_reported_without_retry() {
        let device = MockInverter::new();
        device.set_register(0xE204, 0);
        device.ignore_writes(0xE204);
        let (mut coordinator, _) = coordinator(&device, config(), RegisterTable::hf_series());

        let err = coordinator
            .write(0xE204, Value::Choice("sbu".into()))
            .await
            .unwrap_err();
        let Error::WriteVerification {
            written, read_back, ..
        } = err
        else {
            panic!("expected verification error, got {err:?}");
        };
        assert_eq!(written, vec![2]);
        assert_eq!(read_back, vec![0]);
        let writes = device
            .request_log()
            .into_iter()
            .filter(|(fc, _)| *fc == 0x06)
            .count();
        assert_eq!(writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_values_never_reach_the_device() {
        let device = MockInverter::new();
        let (mut coordinator, _) = coordinator(&device, config(), RegisterTable::hf_series());

        let err = coordinator
            .write(0xE009, Value::Number(80.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { address: 0xE009, .. }));
        let err = coordinator
            .write(0x0100, Value::Number(1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { address: 0x0100, .. }));
        assert_eq!(device.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_serves_requests_in_order() {
        let device = MockInverter::new();
        device.set_register(0x0100, 42);
        let cancel = CancellationToken::new();
        let (coordinator, handle) = Coordinator::new(
            config(),
            soc_and_priority(),
            device.link(),
            Arc::new(MemoryStore::default()),
            cancel.clone(),
        );
        let mut updates = handle.subscribe();
        let task = coordinator.spawn();

        let PollUpdate::CycleComplete(report) = updates.recv().await.unwrap() else {
            panic!("expected cycle report");
        };
        assert_eq!(report.fresh, 2);

        let (write, read) = tokio::join!(
            handle.write(0xE204, Value::Number(2.0)),
            handle.read(0xE204)
        );
        write.unwrap();
        assert_eq!(read.unwrap(), Reading::Fresh(Value::Choice("sbu".into())));
        assert!(matches!(
            updates.recv().await.unwrap(),
            PollUpdate::Written { address: 0xE204, .. }
        ));

        let diagnostics = handle.diagnostics().await.unwrap();
        assert!(diagnostics.connected);
        assert_eq!(diagnostics.cycles, 1);
        assert!(diagnostics.connection_quality.unwrap() > 0.99);

        cancel.cancel();
        task.await.unwrap();
        assert!(matches!(handle.read(0x0100).await, Err(Error::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_write_is_never_sent() {
        let device = MockInverter::new();
        let cancel = CancellationToken::new();
        let (coordinator, handle) = Coordinator::new(
            config(),
            soc_and_priority(),
            device.link(),
            Arc::new(MemoryStore::default()),
            cancel.clone(),
        );
        let mut updates = handle.subscribe();
        let task = coordinator.spawn();
        assert!(matches!(
            updates.recv().await.unwrap(),
            PollUpdate::CycleComplete(_)
        ));

        device.set_latency(Duration::from_secs(1));
        device.clear_requests();
        let refresh = tokio::spawn({
            let handle = handle.clone();
            async move { handle.force_refresh().await }
        });
        while device.reads().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Queued behind the refresh, then given up on by the caller.
        let write = tokio::time::timeout(
            Duration::from_millis(100),
            handle.write(0xE204, Value::Number(2.0)),
        )
        .await;
        assert!(write.is_err());

        refresh.await.unwrap().unwrap();
        handle.diagnostics().await.unwrap();
        assert!(device.request_log().iter().all(|&(function, _)| function != 0x06));
        assert_eq!(device.register(0xE204), None);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn learned_timeouts_survive_restart() {
        let device = MockInverter::new();
        device.set_latency(Duration::from_millis(300));
        let (mut coordinator, store) = coordinator(&device, config(), table(&[0x0100]));
        for _ in 0..20 {
            coordinator.poll_cycle().await.unwrap();
        }
        coordinator.shutdown().await;
        let learned = coordinator.learner.learned().clone();
        assert!(learned.contains_key(&OpKind::ReadRegister));

        let (restarted, _) = Coordinator::new(
            config(),
            table(&[0x0100]),
            device.link(),
            store,
            CancellationToken::new(),
        );
        assert_eq!(restarted.learner.learned(), &learned);
        let timeout = restarted.learner.timeout_for(OpKind::ReadRegister);
        assert_eq!(timeout, learned[&OpKind::ReadRegister].timeout);
        assert!(timeout >= Duration::from_millis(450) && timeout < Duration::from_millis(500));
    }
}
