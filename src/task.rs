//! Task orchestrator: the fixed-period control loop driving the protocol
//! engine.
//!
//! Each tick pulls at most one inbound command, drains clock-originated
//! events, evaluates recovery, refreshes the connection mirror and sleeps
//! off the remainder of the period. Back-to-back commands queue and are
//! served one per tick in arrival order, which bounds worst-case command
//! latency by queue depth times the tick period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, error, info, warn};
use serde_json::json;

use crate::channel::GatewayChannels;
use crate::command::{self, ClockCommand, CommandOp};
use crate::dgt::{self, Dgt3000, MAIN_BUTTON_MASK};
use crate::error::{DgtError, SystemErrorCode, map_dgt_error};
use crate::event::{CommandResponse, Event, PRIORITY_URGENT};
use crate::recovery::RecoveryGate;
use crate::repeat::RepeatTracker;
use crate::stats::{StatusSnapshot, TaskStats};

const RESPONSE_SEND_TIMEOUT: Duration = Duration::from_millis(100);
const EVENT_SEND_TIMEOUT: Duration = Duration::from_millis(2);
const URGENT_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Lifecycle of the orchestrator itself, independent of the clock
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Initialized,
    Running,
    Stopping,
    Error,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Initialized => "initialized",
            TaskState::Running => "running",
            TaskState::Stopping => "stopping",
            TaskState::Error => "error",
        }
    }
}

/// Mirror of the clock connection as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Configured,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Configured => "configured",
            ConnectionState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    pub tick_period: Duration,
    pub recovery_delay: Duration,
    /// Recovery attempt ceiling; 0 means unlimited.
    pub max_recovery_attempts: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(10),
            recovery_delay: Duration::from_millis(1000),
            max_recovery_attempts: 0,
        }
    }
}

pub struct GatewayTask {
    inner: Arc<TaskInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct TaskInner {
    dgt: Arc<Dgt3000>,
    channels: Arc<GatewayChannels>,
    cfg: TaskConfig,
    state: Mutex<TaskState>,
    running: AtomicBool,
    transport_up: AtomicBool,
    bringing_up: AtomicBool,
    connection: Mutex<ConnectionState>,
    recovery: Mutex<RecoveryGate>,
    repeat: Mutex<RepeatTracker>,
    stats: Mutex<TaskStats>,
    started_at: Instant,
}

impl GatewayTask {
    pub fn new(dgt: Arc<Dgt3000>, channels: Arc<GatewayChannels>, cfg: TaskConfig) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                dgt,
                channels,
                cfg,
                state: Mutex::new(TaskState::Idle),
                running: AtomicBool::new(false),
                transport_up: AtomicBool::new(false),
                bringing_up: AtomicBool::new(false),
                connection: Mutex::new(ConnectionState::Disconnected),
                recovery: Mutex::new(RecoveryGate::new(
                    cfg.max_recovery_attempts,
                    cfg.recovery_delay,
                )),
                repeat: Mutex::new(RepeatTracker::new()),
                stats: Mutex::new(TaskStats::default()),
                started_at: Instant::now(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn initialize(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if *state != TaskState::Idle {
            bail!("task already initialized ({})", state.as_str());
        }
        *state = TaskState::Initialized;
        info!("clock task initialized");
        Ok(())
    }

    /// Spawns the dedicated worker. The worker owns all bus timing; the
    /// host only talks to it through the channels and the hooks below.
    pub fn start(&self) -> Result<()> {
        {
            let state = self.inner.state.lock().unwrap();
            if *state != TaskState::Initialized {
                bail!("cannot start task from state {}", state.as_str());
            }
        }
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            warn!("task already running");
            return Ok(());
        }

        self.inner.running.store(true, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        match thread::Builder::new()
            .name("clock-task".into())
            .spawn(move || inner.run_loop())
        {
            Ok(handle) => {
                *worker = Some(handle);
                *self.inner.state.lock().unwrap() = TaskState::Running;
                info!("clock task started");
                Ok(())
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                *self.inner.state.lock().unwrap() = TaskState::Error;
                Err(e).context("spawn clock task")
            }
        }
    }

    /// Graceful stop: the worker notices the flag at its next tick and
    /// exits. This is the only path that guarantees in-flight protocol
    /// exchanges complete.
    pub fn stop(&self) {
        let Some(handle) = self.worker.lock().unwrap().take() else {
            return;
        };
        info!("stopping clock task");
        *self.inner.state.lock().unwrap() = TaskState::Stopping;
        self.inner.running.store(false, Ordering::Release);
        if handle.join().is_err() {
            error!("clock task panicked");
            *self.inner.state.lock().unwrap() = TaskState::Error;
        } else {
            *self.inner.state.lock().unwrap() = TaskState::Initialized;
            info!("clock task stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        *self.inner.state.lock().unwrap() == TaskState::Running
    }

    /// Transport came up: bring the engine up and configure the clock.
    pub fn on_transport_connected(&self) {
        self.inner.on_transport_connected();
    }

    /// Transport went away: power the clock down cleanly.
    pub fn on_transport_disconnected(&self) {
        self.inner.on_transport_disconnected();
    }

    pub fn status(&self) -> StatusSnapshot {
        self.inner.status_snapshot()
    }
}

impl TaskInner {
    fn run_loop(&self) {
        info!("clock task loop running");
        while self.running.load(Ordering::Acquire) {
            let tick_start = Instant::now();

            self.process_command();
            if self.dgt.is_connected() {
                self.pump_clock_events();
            }
            self.monitor_connection();
            self.refresh_connection_mirror();

            // Keep the period steady regardless of how long the tick took.
            let elapsed = tick_start.elapsed();
            if elapsed < self.cfg.tick_period {
                thread::sleep(self.cfg.tick_period - elapsed);
            }
        }
        info!("clock task loop finished");
    }

    /// Dequeues and serves at most one command per tick.
    fn process_command(&self) {
        let Some(raw) = self.channels.recv_command(Duration::ZERO) else {
            return;
        };
        self.stats.lock().unwrap().commands_received += 1;
        debug!("command spent {:?} queued", raw.received_at.elapsed());

        let cmd = match command::parse_raw(&raw) {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!("rejecting inbound command: {}", err.message);
                self.stats.lock().unwrap().commands_failed += 1;
                match err.id {
                    Some(id) => self.send_error_response(&id, err.code, &err.message),
                    // No id means nothing to correlate a response to.
                    None => debug!("unparseable command carried no id, dropping"),
                }
                return;
            }
        };

        info!("processing command {} (id {})", cmd.op.name(), cmd.id);
        if cmd.op.needs_clock() && !self.dgt.is_connected() {
            self.stats.lock().unwrap().commands_failed += 1;
            self.send_error_response(&cmd.id, SystemErrorCode::NotConfigured, "DGT3000 not connected");
            return;
        }

        let ok = self.execute(&cmd);
        let mut stats = self.stats.lock().unwrap();
        if ok {
            stats.commands_executed += 1;
        } else {
            stats.commands_failed += 1;
        }
    }

    fn execute(&self, cmd: &ClockCommand) -> bool {
        match &cmd.op {
            CommandOp::SetTime {
                left_mode,
                left_hours,
                left_minutes,
                left_seconds,
                right_mode,
                right_hours,
                right_minutes,
                right_seconds,
            } => self.respond_engine(
                &cmd.id,
                "time set",
                self.dgt.set_and_run(
                    *left_mode,
                    *left_hours,
                    *left_minutes,
                    *left_seconds,
                    *right_mode,
                    *right_hours,
                    *right_minutes,
                    *right_seconds,
                ),
            ),
            CommandOp::DisplayText {
                text,
                beep,
                left_dots,
                right_dots,
            } => self.respond_engine(
                &cmd.id,
                "text displayed",
                self.dgt.display_text(text, *beep, *left_dots, *right_dots),
            ),
            CommandOp::EndDisplay => {
                self.respond_engine(&cmd.id, "display ended", self.dgt.end_display())
            }
            CommandOp::Stop => self.respond_engine(&cmd.id, "timers stopped", self.dgt.stop()),
            CommandOp::Run {
                left_mode,
                right_mode,
            } => self.respond_engine(
                &cmd.id,
                "timers running",
                self.dgt.run(*left_mode, *right_mode),
            ),
            CommandOp::GetTime => match self.dgt.time() {
                Ok(t) => {
                    self.send_response(CommandResponse::ok(
                        &cmd.id,
                        json!({
                            "leftHours": t.left_hours,
                            "leftMinutes": t.left_minutes,
                            "leftSeconds": t.left_seconds,
                            "rightHours": t.right_hours,
                            "rightMinutes": t.right_minutes,
                            "rightSeconds": t.right_seconds,
                        }),
                    ));
                    true
                }
                Err(err) => {
                    self.handle_engine_error(err);
                    self.send_error_response(&cmd.id, map_dgt_error(err), &err.to_string());
                    false
                }
            },
            CommandOp::GetStatus => {
                let snapshot = self.status_snapshot();
                let result = serde_json::to_value(&snapshot).unwrap_or(json!({}));
                self.send_response(CommandResponse::ok(&cmd.id, result));
                true
            }
        }
    }

    fn respond_engine(
        &self,
        id: &str,
        success_status: &str,
        result: Result<(), DgtError>,
    ) -> bool {
        match result {
            Ok(()) => {
                self.send_response(CommandResponse::ok(id, json!({ "status": success_status })));
                true
            }
            Err(err) => {
                self.handle_engine_error(err);
                self.send_error_response(id, map_dgt_error(err), &err.to_string());
                false
            }
        }
    }

    /// Button and time events synthesized from the engine's caches.
    fn pump_clock_events(&self) {
        // Discrete button events: drain the ring fully.
        while let Some(code) = self.dgt.next_button_event() {
            let name = dgt::button_name(code);
            info!("button event: {name} ({code:#04x})");
            if self.emit(Event::button(name, code, None)) {
                // A discrete event always restarts hold tracking.
                self.repeat.lock().unwrap().reset();
            }
        }

        // Hold-repeat: only the five main buttons participate.
        let held = self.dgt.button_state() & MAIN_BUTTON_MASK;
        let fired = self.repeat.lock().unwrap().poll(held, Instant::now());
        if let Some((mask, count)) = fired {
            info!("button repeat: {} (count {count})", dgt::button_name(mask));
            self.emit(Event::button(dgt::button_name(mask), mask, Some(count)));
        }

        // Fresh time from the clock.
        if self.dgt.take_new_time()
            && let Ok(t) = self.dgt.time()
        {
            self.emit(Event::time_update(&t));
        }
    }

    fn monitor_connection(&self) {
        let eligible = {
            let gate = self.recovery.lock().unwrap();
            gate.eligible(
                self.dgt.is_connected(),
                self.transport_up.load(Ordering::Acquire),
                self.dgt.is_configuring() || self.bringing_up.load(Ordering::Acquire),
            )
        };
        if !eligible || !self.recovery.lock().unwrap().try_begin(Instant::now()) {
            return;
        }

        let attempt = self.recovery.lock().unwrap().attempts();
        self.stats.lock().unwrap().recovery_attempts = attempt;
        info!("attempting clock recovery (attempt {attempt})");

        match self.dgt.configure() {
            Ok(()) => {
                info!("clock recovery successful");
                self.recovery.lock().unwrap().record_success();
                *self.connection.lock().unwrap() = ConnectionState::Configured;
                self.emit(Event::connection_status(true, true));
            }
            Err(err) => warn!("clock recovery failed: {err}"),
        }
    }

    fn refresh_connection_mirror(&self) {
        let next = if self.dgt.is_configured() {
            ConnectionState::Configured
        } else if self.dgt.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        *self.connection.lock().unwrap() = next;
    }

    fn on_transport_connected(&self) {
        info!("transport connected, bringing clock up");
        self.transport_up.store(true, Ordering::Release);
        if self.bringing_up.swap(true, Ordering::AcqRel) {
            warn!("clock bring-up already in progress");
            return;
        }
        let result = self.bring_up();
        self.bringing_up.store(false, Ordering::Release);
        match result {
            Ok(()) => {
                // Push an initial status so the freshly connected client
                // does not have to poll for one.
                self.emit(Event::system_status(&self.status_snapshot()));
            }
            Err(err) => {
                error!("clock bring-up failed: {err}");
                *self.connection.lock().unwrap() = ConnectionState::Error;
                self.emit(Event::error(map_dgt_error(err), "failed to initialize clock"));
                // The recovery gate takes it from here, one bounded
                // attempt at a time.
            }
        }
    }

    fn bring_up(&self) -> Result<(), DgtError> {
        self.dgt.begin().map_err(|_| DgtError::InitFailed)?;
        self.dgt.configure()?;
        self.recovery.lock().unwrap().reset();
        *self.connection.lock().unwrap() = ConnectionState::Configured;
        self.emit(Event::connection_status(true, true));
        Ok(())
    }

    fn on_transport_disconnected(&self) {
        info!("transport disconnected, powering clock down");
        self.transport_up.store(false, Ordering::Release);
        self.dgt.end();
        *self.connection.lock().unwrap() = ConnectionState::Disconnected;
        self.recovery.lock().unwrap().reset();
        self.emit(Event::connection_status(false, false));
    }

    fn handle_engine_error(&self, err: DgtError) {
        error!("clock error: {err}");
        self.stats.lock().unwrap().clock_errors += 1;
        self.emit(Event::error(map_dgt_error(err), &err.to_string()));

        if err.is_connection_affecting() {
            self.dgt.rx().mark_disconnected();
            let mut connection = self.connection.lock().unwrap();
            if *connection != ConnectionState::Disconnected {
                warn!("clock disconnected due to error");
                *connection = ConnectionState::Disconnected;
                drop(connection);
                self.emit(Event::connection_status(false, false));
            }
        }
    }

    /// Routes by the event's own priority; counts only what was actually
    /// queued.
    fn emit(&self, event: Event) -> bool {
        let sent = if event.priority == PRIORITY_URGENT {
            self.channels.send_priority_event(event, URGENT_SEND_TIMEOUT)
        } else {
            self.channels.send_event(event, EVENT_SEND_TIMEOUT)
        };
        if sent {
            self.stats.lock().unwrap().events_generated += 1;
        }
        sent
    }

    fn send_response(&self, response: CommandResponse) {
        if !self.channels.send_response(response, RESPONSE_SEND_TIMEOUT) {
            warn!("failed to queue command response");
        }
    }

    fn send_error_response(&self, id: &str, code: SystemErrorCode, message: &str) {
        self.send_response(CommandResponse::err(id, code, message));
    }

    fn status_snapshot(&self) -> StatusSnapshot {
        let (command_depth, event_depth, response_depth) = self.channels.depths();
        let last = self.dgt.last_error();
        StatusSnapshot {
            task_state: self.state.lock().unwrap().as_str(),
            connection_state: self.connection.lock().unwrap().as_str(),
            clock_connected: self.dgt.is_connected(),
            clock_configured: self.dgt.is_configured(),
            transport_connected: self.transport_up.load(Ordering::Acquire),
            last_error_code: last.map(|e| map_dgt_error(e).code()).unwrap_or(0),
            last_error: last.map(|e| e.to_string()).unwrap_or_else(|| "none".into()),
            command_queue_depth: command_depth,
            event_queue_depth: event_depth,
            response_queue_depth: response_depth,
            queues_healthy: self.channels.is_healthy(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            stats: *self.stats.lock().unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RawCommand;
    use crate::dgt::testutil::{FakeBusState, fake_engine};
    use crate::event::EventKind;

    fn test_task() -> (GatewayTask, Arc<Mutex<FakeBusState>>, Arc<GatewayChannels>) {
        let (engine, bus) = fake_engine();
        let channels = Arc::new(GatewayChannels::new());
        let task = GatewayTask::new(
            Arc::new(engine),
            Arc::clone(&channels),
            TaskConfig {
                tick_period: Duration::from_millis(1),
                recovery_delay: Duration::from_millis(1000),
                max_recovery_attempts: 3,
            },
        );
        (task, bus, channels)
    }

    fn push_command(channels: &GatewayChannels, json: &str) {
        assert!(channels.send_command(RawCommand::new(json.into()), Duration::ZERO));
    }

    #[test]
    fn out_of_range_set_time_never_touches_the_bus() {
        let (task, bus, channels) = test_task();
        push_command(
            &channels,
            r#"{"id":"e2e","command":"setTime","params":{"leftMode":0,"leftHours":10,"leftMinutes":0,"leftSeconds":0,"rightMode":0,"rightHours":0,"rightMinutes":0,"rightSeconds":0}}"#,
        );
        task.inner.process_command();

        let response = channels.recv_response(Duration::ZERO).unwrap();
        assert_eq!(response.id, "e2e");
        assert!(!response.success);
        let err = response.error.unwrap();
        assert_eq!(err.code, SystemErrorCode::InvalidParameters);
        assert_eq!(bus.lock().unwrap().transmit_attempts, 0);
    }

    #[test]
    fn commands_needing_clock_fail_fast_when_disconnected() {
        let (task, bus, channels) = test_task();
        push_command(&channels, r#"{"id":"c1","command":"stop"}"#);
        task.inner.process_command();

        let response = channels.recv_response(Duration::ZERO).unwrap();
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, SystemErrorCode::NotConfigured);
        assert_eq!(bus.lock().unwrap().transmit_attempts, 0);
    }

    #[test]
    fn one_command_per_tick() {
        let (task, _bus, channels) = test_task();
        push_command(&channels, r#"{"id":"a","command":"getStatus"}"#);
        push_command(&channels, r#"{"id":"b","command":"getStatus"}"#);

        task.inner.process_command();
        let (depth, _, _) = channels.depths();
        assert_eq!(depth, 1);
        assert_eq!(channels.recv_response(Duration::ZERO).unwrap().id, "a");

        task.inner.process_command();
        assert_eq!(channels.recv_response(Duration::ZERO).unwrap().id, "b");
    }

    #[test]
    fn get_status_works_without_a_clock() {
        let (task, _bus, channels) = test_task();
        push_command(&channels, r#"{"id":"s","command":"getStatus"}"#);
        task.inner.process_command();

        let response = channels.recv_response(Duration::ZERO).unwrap();
        assert!(response.success);
        let result = response.result.unwrap();
        assert_eq!(result["clockConnected"], false);
        assert_eq!(result["taskState"], "idle");
    }

    #[test]
    fn unparseable_command_without_id_is_dropped_silently() {
        let (task, _bus, channels) = test_task();
        push_command(&channels, "{broken");
        task.inner.process_command();
        assert!(channels.recv_response(Duration::ZERO).is_none());
        assert_eq!(task.inner.stats.lock().unwrap().commands_failed, 1);
    }

    #[test]
    fn button_and_time_events_flow_out() {
        let (task, _bus, channels) = test_task();
        task.inner.dgt.begin().unwrap();
        let rx = task.inner.dgt.rx();
        rx.mark_configured();

        // One button press and one time message from the clock.
        rx.on_frame(&[0x10, 0x06, 0x05, 0x01, 0x00]);
        let mut time = [0u8; 20];
        time[0] = 0x10;
        time[1] = 0x18;
        time[2] = 0x04;
        time[4] = 1;
        time[5] = 0x30;
        rx.on_frame(&time);

        task.inner.pump_clock_events();

        // The button event was front-inserted, the time event appended.
        let first = channels.recv_event(Duration::ZERO).unwrap();
        assert_eq!(first.kind, EventKind::Button);
        assert_eq!(first.data["button"], "back");
        let second = channels.recv_event(Duration::ZERO).unwrap();
        assert_eq!(second.kind, EventKind::TimeUpdate);
        assert_eq!(second.data["leftMinutes"], 30);

        assert_eq!(task.inner.stats.lock().unwrap().events_generated, 2);
    }

    #[test]
    fn recovery_is_rate_limited_per_tick() {
        let (task, bus, _channels) = test_task();
        task.inner.dgt.begin().unwrap();
        bus.lock().unwrap().fail_transmit = true;
        task.inner.transport_up.store(true, Ordering::Release);

        // Several immediate ticks: the inter-attempt delay allows only
        // one configure attempt.
        for _ in 0..5 {
            task.inner.monitor_connection();
        }
        assert_eq!(task.inner.recovery.lock().unwrap().attempts(), 1);
        assert_eq!(task.inner.stats.lock().unwrap().recovery_attempts, 1);
    }

    #[test]
    fn engine_error_forces_disconnect_and_events() {
        let (task, _bus, channels) = test_task();
        *task.inner.connection.lock().unwrap() = ConnectionState::Configured;
        task.inner.handle_engine_error(DgtError::NoAck);

        assert_eq!(
            *task.inner.connection.lock().unwrap(),
            ConnectionState::Disconnected
        );
        // Connection status was front-inserted after the error event.
        let first = channels.recv_event(Duration::ZERO).unwrap();
        assert_eq!(first.kind, EventKind::ConnectionStatus);
        assert_eq!(first.data["connected"], false);
        let second = channels.recv_event(Duration::ZERO).unwrap();
        assert_eq!(second.kind, EventKind::Error);
        assert_eq!(second.data["errorCode"], 300);
    }

    #[test]
    fn lifecycle_runs_and_stops_cleanly() {
        let (task, _bus, channels) = test_task();
        task.initialize().unwrap();
        assert!(task.start().is_ok());
        assert!(task.is_running());

        push_command(&channels, r#"{"id":"live","command":"getStatus"}"#);
        let response = channels
            .recv_response(Duration::from_millis(500))
            .expect("worker should serve the command");
        assert!(response.success);
        assert_eq!(response.result.unwrap()["taskState"], "running");

        task.stop();
        assert!(!task.is_running());
        assert_eq!(*task.inner.state.lock().unwrap(), TaskState::Initialized);
    }

    #[test]
    fn start_requires_initialization() {
        let (task, _bus, _channels) = test_task();
        assert!(task.start().is_err());
    }
}
