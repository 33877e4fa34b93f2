//! Bounded, ownership-transferring channels between the orchestrator and
//! the transport collaborator.
//!
//! One channel per message kind: raw commands in, events out, responses
//! out. Sends block up to a timeout for space; a timed-out send hands the
//! message back to the caller instead of dropping it. Priority sends
//! insert at the front of the event queue for urgent traffic.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

use crate::command::RawCommand;
use crate::event::{CommandResponse, Event};
use crate::stats::QueueStats;

pub const COMMAND_QUEUE_CAPACITY: usize = 10;
pub const EVENT_QUEUE_CAPACITY: usize = 20;
pub const RESPONSE_QUEUE_CAPACITY: usize = 10;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const HEALTH_THRESHOLD: f32 = 0.8;

/// The send timed out; the message comes back to the caller, which now
/// owns it again.
#[derive(Debug, Error)]
#[error("channel full, send timed out")]
pub struct SendTimeout<T>(pub T);

pub struct Channel<T> {
    name: &'static str,
    capacity: usize,
    queue: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Channel<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be nonzero");
        Self {
            name,
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn send(&self, item: T, timeout: Duration) -> Result<(), SendTimeout<T>> {
        self.push(item, timeout, false)
    }

    /// Front-of-queue insert for urgent messages. This is a single
    /// front-insert, not a separate priority queue: the most recent
    /// urgent message ends up first.
    pub fn send_front(&self, item: T, timeout: Duration) -> Result<(), SendTimeout<T>> {
        self.push(item, timeout, true)
    }

    fn push(&self, item: T, timeout: Duration, front: bool) -> Result<(), SendTimeout<T>> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap();
        while queue.len() >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                debug!("channel {} full, returning message to sender", self.name);
                return Err(SendTimeout(item));
            }
            let (guard, _) = self.not_full.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
        }
        if front {
            queue.push_front(item);
        } else {
            queue.push_back(item);
        }
        drop(queue);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks up to `timeout` for an item. Timing out is "no item", not
    /// an error; a zero timeout is a non-blocking poll.
    pub fn recv(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(item) = queue.pop_front() {
                drop(queue);
                self.not_full.notify_one();
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.not_empty.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
        }
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn utilization(&self) -> f32 {
        self.depth() as f32 / self.capacity as f32
    }

    /// Drains and drops everything still queued. Returns the count.
    pub fn flush(&self) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let drained = queue.len();
        queue.clear();
        drop(queue);
        self.not_full.notify_all();
        drained
    }
}

struct HealthCache {
    checked_at: Option<Instant>,
    healthy: bool,
}

/// The three channels wiring the orchestrator to the transport, plus
/// utilization accounting.
pub struct GatewayChannels {
    commands: Channel<RawCommand>,
    events: Channel<Event>,
    responses: Channel<CommandResponse>,
    stats: Mutex<QueueStats>,
    health: Mutex<HealthCache>,
}

impl GatewayChannels {
    pub fn new() -> Self {
        Self {
            commands: Channel::new("commands", COMMAND_QUEUE_CAPACITY),
            events: Channel::new("events", EVENT_QUEUE_CAPACITY),
            responses: Channel::new("responses", RESPONSE_QUEUE_CAPACITY),
            stats: Mutex::new(QueueStats::default()),
            health: Mutex::new(HealthCache {
                checked_at: None,
                healthy: true,
            }),
        }
    }

    // --- raw commands (transport -> orchestrator) ---

    pub fn send_command(&self, command: RawCommand, timeout: Duration) -> bool {
        match self.commands.send(command, timeout) {
            Ok(()) => true,
            Err(SendTimeout(dropped)) => {
                warn!("command queue full, dropping command: {}", dropped.json);
                false
            }
        }
    }

    pub fn recv_command(&self, timeout: Duration) -> Option<RawCommand> {
        self.commands.recv(timeout)
    }

    // --- events (orchestrator -> transport) ---

    pub fn send_event(&self, event: Event, timeout: Duration) -> bool {
        let sent = self.events.send(event, timeout);
        self.note_event_send(&sent);
        if let Err(SendTimeout(dropped)) = sent {
            warn!("event queue full, dropping {} event", dropped.kind.as_str());
            return false;
        }
        true
    }

    /// Front-inserts an urgent event (clock errors, fresh connection
    /// status) so it overtakes queued routine traffic.
    pub fn send_priority_event(&self, event: Event, timeout: Duration) -> bool {
        let sent = self.events.send_front(event, timeout);
        self.note_event_send(&sent);
        if let Err(SendTimeout(dropped)) = sent {
            warn!("event queue full, dropping priority {} event", dropped.kind.as_str());
            return false;
        }
        true
    }

    pub fn recv_event(&self, timeout: Duration) -> Option<Event> {
        let received = self.events.recv(timeout);
        let mut stats = self.stats.lock().unwrap();
        match received {
            Some(_) => stats.events_processed += 1,
            None => stats.queue_timeouts += 1,
        }
        received
    }

    fn note_event_send<E>(&self, sent: &Result<(), E>) {
        let mut stats = self.stats.lock().unwrap();
        match sent {
            Ok(()) => {
                stats.events_queued += 1;
                let depth = self.events.depth();
                if depth > stats.max_event_queue_depth {
                    stats.max_event_queue_depth = depth;
                }
            }
            Err(_) => stats.queue_overflows += 1,
        }
    }

    // --- responses (orchestrator -> transport) ---

    pub fn send_response(&self, response: CommandResponse, timeout: Duration) -> bool {
        match self.responses.send(response, timeout) {
            Ok(()) => true,
            Err(SendTimeout(dropped)) => {
                warn!("response queue full, dropping response for id {}", dropped.id);
                false
            }
        }
    }

    pub fn recv_response(&self, timeout: Duration) -> Option<CommandResponse> {
        self.responses.recv(timeout)
    }

    // --- monitoring ---

    pub fn depths(&self) -> (usize, usize, usize) {
        (
            self.commands.depth(),
            self.events.depth(),
            self.responses.depth(),
        )
    }

    pub fn statistics(&self) -> QueueStats {
        *self.stats.lock().unwrap()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock().unwrap() = QueueStats::default();
    }

    /// Healthy while every channel sits below the utilization threshold.
    /// The verdict is cached between checks.
    pub fn is_healthy(&self) -> bool {
        let mut cache = self.health.lock().unwrap();
        let now = Instant::now();
        if let Some(checked_at) = cache.checked_at
            && now.duration_since(checked_at) < HEALTH_CHECK_INTERVAL
        {
            return cache.healthy;
        }
        cache.checked_at = Some(now);

        let utilizations = [
            self.commands.utilization(),
            self.events.utilization(),
            self.responses.utilization(),
        ];
        cache.healthy = utilizations.iter().all(|u| *u < HEALTH_THRESHOLD);
        if !cache.healthy {
            warn!(
                "queue health check failed: cmd={:.0}% evt={:.0}% resp={:.0}%",
                utilizations[0] * 100.0,
                utilizations[1] * 100.0,
                utilizations[2] * 100.0
            );
        }
        cache.healthy
    }

    /// Teardown path: drains whatever is still queued.
    pub fn flush_all(&self) {
        let commands = self.commands.flush();
        let events = self.events.flush();
        let responses = self.responses.flush();
        if commands + events + responses > 0 {
            warn!("flushed queues: {commands} commands, {events} events, {responses} responses");
        }
    }
}

impl Default for GatewayChannels {
    fn default() -> Self {
        Self::new()
    }
}
