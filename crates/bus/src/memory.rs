//! In-memory message bus.
//!
//! Mirrors the JetStream semantics Conduit relies on: subject-captured
//! streams with retention limits, durable explicit-ack consumers that resume
//! unacknowledged messages, redelivery on nak or on an expired ack wait
//! bounded by `max_deliver`, progress signals that push the ack deadline out,
//! and `max_ack_pending` flow control. Every ack and nak is recorded so tests
//! can assert on them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use conduit_core::{DiscardPolicy, StreamDescriptor};

use crate::backend::{
    Acknowledge, ConsumerSpec, Delivery, DeliveryStream, MessageBus, PublishReceipt, StoredMessage,
};
use crate::error::{BusError, BusResult};
use crate::subject::subject_matches;

/// How a delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    Nacked,
}

/// One entry of the ack ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub durable_name: String,
    pub sequence: u64,
    pub attempt: u64,
    pub outcome: AckOutcome,
}

#[derive(Debug, Clone)]
struct MemMessage {
    subject: String,
    sequence: u64,
    payload: Bytes,
    stored_at: Instant,
}

#[derive(Debug)]
struct MemStream {
    descriptor: StreamDescriptor,
    messages: VecDeque<MemMessage>,
    next_sequence: u64,
    bytes: u64,
}

impl MemStream {
    fn new(descriptor: StreamDescriptor) -> Self {
        Self {
            descriptor,
            messages: VecDeque::new(),
            next_sequence: 1,
            bytes: 0,
        }
    }

    fn expire(&mut self, now: Instant) {
        let max_age = self.descriptor.max_age;
        if max_age.is_zero() {
            return;
        }
        while self
            .messages
            .front()
            .is_some_and(|m| now.saturating_duration_since(m.stored_at) > max_age)
        {
            self.drop_oldest();
        }
    }

    fn drop_oldest(&mut self) {
        if let Some(old) = self.messages.pop_front() {
            self.bytes = self.bytes.saturating_sub(old.payload.len() as u64);
        }
    }

    fn over_limits(&self, extra_messages: u64, extra_bytes: u64) -> bool {
        let d = &self.descriptor;
        (d.max_messages > 0 && self.messages.len() as u64 + extra_messages > d.max_messages)
            || (d.max_bytes > 0 && self.bytes + extra_bytes > d.max_bytes)
    }

    fn append(&mut self, subject: &str, payload: Bytes) -> BusResult<u64> {
        let size = payload.len() as u64;
        let limit = self.descriptor.max_message_size;
        if limit > 0 && size > u64::from(limit) {
            return Err(BusError::PayloadTooLarge {
                size: payload.len(),
                limit: limit as usize,
            });
        }

        self.expire(Instant::now());
        match self.descriptor.discard_policy {
            DiscardPolicy::Old => {
                while !self.messages.is_empty() && self.over_limits(1, size) {
                    self.drop_oldest();
                }
            }
            DiscardPolicy::New => {
                if self.over_limits(1, size) {
                    return Err(BusError::publish_failed(subject, "maximum messages exceeded"));
                }
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.bytes += size;
        self.messages.push_back(MemMessage {
            subject: subject.to_string(),
            sequence,
            payload,
            stored_at: Instant::now(),
        });
        Ok(sequence)
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    token: u64,
    attempt: u64,
    deadline: Option<Instant>,
}

#[derive(Debug)]
struct Durable {
    spec: ConsumerSpec,
    acked: BTreeSet<u64>,
    pending: BTreeMap<u64, Pending>,
    /// Matched messages waiting for room under `max_ack_pending`.
    held: VecDeque<MemMessage>,
    next_token: u64,
    sender: Option<mpsc::UnboundedSender<BusResult<Delivery>>>,
}

impl Durable {
    fn new(spec: ConsumerSpec) -> Self {
        Self {
            spec,
            acked: BTreeSet::new(),
            pending: BTreeMap::new(),
            held: VecDeque::new(),
            next_token: 0,
            sender: None,
        }
    }

    fn key(&self) -> (String, String) {
        (self.spec.stream.clone(), self.spec.durable_name.clone())
    }

    fn has_room(&self) -> bool {
        let max = self.spec.max_ack_pending;
        max <= 0 || (self.pending.len() as u64) < max.unsigned_abs()
    }

    fn is_settled_or_out(&self, sequence: u64) -> bool {
        self.acked.contains(&sequence) || self.pending.contains_key(&sequence)
    }

    /// First delivery of a matched message, or hold it until there is room.
    fn offer(&mut self, shared: &Arc<Mutex<State>>, message: MemMessage) {
        if self.is_settled_or_out(message.sequence) {
            return;
        }
        if self.has_room() {
            self.deliver(shared, message, 1);
        } else {
            self.held.push_back(message);
        }
    }

    fn deliver(&mut self, shared: &Arc<Mutex<State>>, message: MemMessage, attempt: u64) {
        let Some(sender) = self.sender.clone() else {
            return;
        };
        self.next_token = self.next_token.saturating_add(1);
        let token = self.next_token;
        let deadline = if self.spec.ack_wait.is_zero() {
            None
        } else {
            Instant::now().checked_add(self.spec.ack_wait)
        };
        self.pending.insert(
            message.sequence,
            Pending {
                token,
                attempt,
                deadline,
            },
        );

        let acker = MemoryAcker {
            state: Arc::clone(shared),
            key: self.key(),
            message: message.clone(),
            attempt,
            token,
        };
        let delivery = Delivery::new(
            message.subject.clone(),
            message.sequence,
            attempt,
            message.payload.clone(),
            Box::new(acker),
        );
        let _ = sender.send(Ok(delivery));

        if deadline.is_some() {
            tokio::spawn(expire_unacked(Arc::clone(shared), self.key(), message, token));
        }
    }

    /// Redeliver after a nak or an expired ack wait, unless attempts are used up.
    fn retry(&mut self, shared: &Arc<Mutex<State>>, message: MemMessage, attempt: u64) {
        self.pending.remove(&message.sequence);
        let max_deliver = self.spec.max_deliver;
        if max_deliver > 0 && attempt >= max_deliver.unsigned_abs() {
            debug!(sequence = message.sequence, attempt, "Delivery attempts exhausted");
            self.release_held(shared);
            return;
        }
        self.deliver(shared, message, attempt.saturating_add(1));
    }

    fn release_held(&mut self, shared: &Arc<Mutex<State>>) {
        while self.has_room() {
            let Some(message) = self.held.pop_front() else {
                break;
            };
            if !self.is_settled_or_out(message.sequence) {
                self.deliver(shared, message, 1);
            }
        }
    }
}

/// Redeliver `message` once its ack deadline passes without ack, nak or progress.
async fn expire_unacked(shared: Arc<Mutex<State>>, key: (String, String), message: MemMessage, token: u64) {
    loop {
        let mut state = shared.lock().await;
        if state.closed {
            return;
        }
        let Some(durable) = state.durables.get_mut(&key) else {
            return;
        };
        let Some(pending) = durable
            .pending
            .get(&message.sequence)
            .copied()
            .filter(|p| p.token == token)
        else {
            return;
        };
        let Some(deadline) = pending.deadline else {
            return;
        };
        if Instant::now() < deadline {
            drop(state);
            tokio::time::sleep_until(deadline).await;
            continue;
        }
        debug!(sequence = message.sequence, attempt = pending.attempt, "Ack wait expired");
        durable.retry(&shared, message, pending.attempt);
        return;
    }
}

#[derive(Debug, Default)]
struct State {
    streams: BTreeMap<String, MemStream>,
    durables: BTreeMap<(String, String), Durable>,
    acks: Vec<AckRecord>,
    progress_signals: u64,
    stream_creations: Vec<String>,
    publish_fault: Option<String>,
    closed: bool,
}

impl State {
    fn ensure_open(&self) -> BusResult<()> {
        if self.closed {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Bus held entirely in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<State>>,
}

impl InMemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every ack and nak seen so far, in order.
    pub async fn acks(&self) -> Vec<AckRecord> {
        self.state.lock().await.acks.clone()
    }

    /// Number of in-progress signals received.
    pub async fn progress_signals(&self) -> u64 {
        self.state.lock().await.progress_signals
    }

    /// Messages currently retained by `stream`.
    pub async fn messages(&self, stream: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .await
            .streams
            .get(stream)
            .map(|s| {
                s.messages
                    .iter()
                    .map(|m| StoredMessage {
                        subject: m.subject.clone(),
                        sequence: m.sequence,
                        payload: m.payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of streams created, in creation order.
    pub async fn stream_creations(&self) -> Vec<String> {
        self.state.lock().await.stream_creations.clone()
    }

    /// Whether `close` has been called.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Make every subsequent publish fail with `reason`; `None` clears it.
    pub async fn set_publish_fault(&self, reason: Option<String>) {
        self.state.lock().await.publish_fault = reason;
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn stream_info(&self, name: &str) -> BusResult<Option<StreamDescriptor>> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        Ok(state.streams.get(name).map(|s| s.descriptor.clone()))
    }

    async fn create_stream(&self, descriptor: &StreamDescriptor) -> BusResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        if state.streams.contains_key(&descriptor.name) {
            return Err(BusError::StreamExists {
                stream: descriptor.name.clone(),
            });
        }
        state
            .streams
            .insert(descriptor.name.clone(), MemStream::new(descriptor.clone()));
        state.stream_creations.push(descriptor.name.clone());
        debug!(stream = %descriptor.name, subjects = %descriptor.subject_pattern, "Created in-memory stream");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<PublishReceipt> {
        let mut guard = self.state.lock().await;
        guard.ensure_open()?;
        if let Some(reason) = &guard.publish_fault {
            return Err(BusError::publish_failed(subject, reason.clone()));
        }

        let State {
            streams, durables, ..
        } = &mut *guard;
        let stream_name = streams
            .values()
            .find(|s| subject_matches(&s.descriptor.subject_pattern, subject))
            .map(|s| s.descriptor.name.clone())
            .ok_or_else(|| BusError::NoStreamForSubject {
                subject: subject.to_string(),
            })?;

        let stream = streams
            .get_mut(&stream_name)
            .ok_or_else(|| BusError::stream_not_found(&stream_name))?;
        let sequence = stream.append(subject, payload)?;

        if let Some(message) = stream.messages.back() {
            for durable in durables.values_mut().filter(|d| {
                d.spec.stream == stream_name
                    && d.sender.is_some()
                    && subject_matches(&d.spec.filter_subject, subject)
            }) {
                durable.offer(&self.state, message.clone());
            }
        }

        Ok(PublishReceipt {
            stream: stream_name,
            sequence,
        })
    }

    async fn last_message(&self, stream: &str, subject: &str) -> BusResult<Option<StoredMessage>> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let mem = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| BusError::stream_not_found(stream))?;
        mem.expire(Instant::now());
        Ok(mem
            .messages
            .iter()
            .rev()
            .find(|m| m.subject == subject)
            .map(|m| StoredMessage {
                subject: m.subject.clone(),
                sequence: m.sequence,
                payload: m.payload.clone(),
            }))
    }

    async fn subscribe(&self, spec: &ConsumerSpec) -> BusResult<DeliveryStream> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let backlog: Vec<MemMessage> = state
            .streams
            .get(&spec.stream)
            .ok_or_else(|| BusError::stream_not_found(&spec.stream))?
            .messages
            .iter()
            .filter(|m| subject_matches(&spec.filter_subject, &m.subject))
            .cloned()
            .collect();

        let key = (spec.stream.clone(), spec.durable_name.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let durable = state
            .durables
            .entry(key)
            .or_insert_with(|| Durable::new(spec.clone()));
        durable.spec = spec.clone();
        durable.pending.clear();
        durable.held.clear();
        durable.sender = Some(tx);

        for message in backlog {
            durable.offer(&self.state, message);
        }

        debug!(stream = %spec.stream, durable = %spec.durable_name, "Bound in-memory consumer");
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn close(&self) -> BusResult<()> {
        let mut state = self.state.lock().await;
        state.closed = true;
        for durable in state.durables.values_mut() {
            durable.sender = None;
        }
        Ok(())
    }
}

struct MemoryAcker {
    state: Arc<Mutex<State>>,
    key: (String, String),
    message: MemMessage,
    attempt: u64,
    token: u64,
}

impl MemoryAcker {
    fn record(&self, state: &mut State, outcome: AckOutcome) {
        state.acks.push(AckRecord {
            durable_name: self.key.1.clone(),
            sequence: self.message.sequence,
            attempt: self.attempt,
            outcome,
        });
    }

    fn is_current(&self, durable: &Durable) -> bool {
        durable
            .pending
            .get(&self.message.sequence)
            .is_some_and(|p| p.token == self.token)
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn in_progress(&self) -> BusResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.progress_signals = state.progress_signals.saturating_add(1);
        let Some(durable) = state.durables.get_mut(&self.key) else {
            return Ok(());
        };
        let ack_wait = durable.spec.ack_wait;
        if let Some(pending) = durable
            .pending
            .get_mut(&self.message.sequence)
            .filter(|p| p.token == self.token)
        {
            if pending.deadline.is_some() {
                pending.deadline = Instant::now().checked_add(ack_wait);
            }
        }
        Ok(())
    }

    async fn ack(self: Box<Self>) -> BusResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        self.record(&mut state, AckOutcome::Acked);
        if let Some(durable) = state.durables.get_mut(&self.key) {
            durable.acked.insert(self.message.sequence);
            durable.pending.remove(&self.message.sequence);
            durable.release_held(&self.state);
        }
        Ok(())
    }

    async fn nak(self: Box<Self>) -> BusResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        self.record(&mut state, AckOutcome::Nacked);
        if let Some(durable) = state.durables.get_mut(&self.key) {
            if self.is_current(durable) {
                durable.retry(&self.state, self.message.clone(), self.attempt);
            }
        }
        Ok(())
    }
}
