//! Receive path of the protocol engine.
//!
//! Frames arrive here from the bus pump asynchronously with respect to
//! the command path, so every handler must be non-blocking: small atomics
//! plus short mutex sections, nothing that can stall the pump.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use log::{debug, info};

use super::{BUTTON_RING_CAPACITY, ClockTime, LEVER_STATE_MASK, LISTEN_ACK, MAIN_BUTTON_MASK, ON_OFF_STATE_MASK};
use crate::ring::ButtonRing;

// Message classes, third byte of every inbound frame.
pub const MSG_ACK: u8 = 0x01;
pub const MSG_WAKE_RESPONSE: u8 = 0x02;
pub const MSG_TIME: u8 = 0x04;
pub const MSG_BUTTON: u8 = 0x05;

// Synthetic event codes for lever and on/off transitions.
pub const EVENT_LEVER_RIGHT: u8 = 0x40;
pub const EVENT_LEVER_LEFT: u8 = 0xC0;
pub const EVENT_ON_OFF_PRESS: u8 = 0x20;
pub const EVENT_ON_OFF_RELEASE: u8 = 0xA0;

const WAKE_RESPONSE: [u8; 6] = [0x10, 0x07, 0x02, 0x22, 0x01, 0x05];
const TIME_LENGTH_MARKER: u8 = 0x18;
const TIME_ECHO_OFFSET: usize = 19;

struct ButtonCache {
    ring: ButtonRing,
    last_raw: u8,
}

/// Receive-side state shared between the bus pump and the engine. The
/// pump writes through [`RxShared::on_frame`]; the engine and the task
/// orchestrator only read/consume.
pub struct RxShared {
    ack_cmd: AtomicU8,
    ack_seen: AtomicBool,
    wake_seen: AtomicBool,
    new_time: AtomicBool,
    connected: AtomicBool,
    configured: AtomicBool,
    time: Mutex<ClockTime>,
    buttons: Mutex<ButtonCache>,
}

impl RxShared {
    pub fn new() -> Self {
        Self {
            ack_cmd: AtomicU8::new(0),
            ack_seen: AtomicBool::new(false),
            wake_seen: AtomicBool::new(false),
            new_time: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            configured: AtomicBool::new(false),
            time: Mutex::new(ClockTime::default()),
            buttons: Mutex::new(ButtonCache {
                ring: ButtonRing::new(BUTTON_RING_CAPACITY),
                last_raw: 0,
            }),
        }
    }

    /// Entry point for the interrupt-like context.
    pub fn on_frame(&self, frame: &[u8]) {
        debug!("<- {frame:02x?}");
        if frame.len() < 3 || frame[0] != LISTEN_ACK {
            debug!("dropping frame not addressed to us");
            return;
        }
        match frame[2] {
            MSG_ACK => self.process_ack(frame),
            MSG_WAKE_RESPONSE => self.process_wake(frame),
            MSG_TIME => self.process_time(frame),
            MSG_BUTTON => self.process_button(frame),
            other => debug!("unknown message type {other:#04x}, dropping"),
        }
    }

    fn process_ack(&self, frame: &[u8]) {
        // ACK format: 10 08 01 <cmd> <status> ...
        if frame.len() < 5 {
            debug!("malformed ack frame");
            return;
        }
        self.ack_cmd.store(frame[3], Ordering::Release);
        self.ack_seen.store(true, Ordering::Release);
        debug!("ack for command {:#04x}", frame[3]);
    }

    fn process_wake(&self, frame: &[u8]) {
        if frame.len() >= WAKE_RESPONSE.len() && frame[..WAKE_RESPONSE.len()] == WAKE_RESPONSE {
            self.wake_seen.store(true, Ordering::Release);
            debug!("wake response");
        } else {
            debug!("invalid wake response");
        }
    }

    fn process_time(&self, frame: &[u8]) {
        // Echo frames confirm our own set-and-run without carrying an update.
        if frame.len() > TIME_ECHO_OFFSET && frame[TIME_ECHO_OFFSET] == 1 {
            debug!("time echo, no update");
            return;
        }
        if frame.len() < 14 || frame[1] != TIME_LENGTH_MARKER {
            debug!("malformed time frame, dropping");
            return;
        }

        let bcd = |b: u8| (b >> 4) * 10 + (b & 0x0F);
        let time = ClockTime {
            left_hours: frame[4] & 0x0F,
            left_minutes: bcd(frame[5]),
            left_seconds: bcd(frame[6]),
            right_hours: frame[10] & 0x0F,
            right_minutes: bcd(frame[11]),
            right_seconds: bcd(frame[12]),
        };
        if !time.is_valid() {
            debug!("time fields out of range, dropping");
            return;
        }

        *self.time.lock().unwrap() = time;
        self.new_time.store(true, Ordering::Release);

        // Any valid time proves the clock is alive again, but central
        // control must be re-established before commands can work.
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!("time messages received, clock connection restored");
            self.configured.store(false, Ordering::Release);
        }
    }

    fn process_button(&self, frame: &[u8]) {
        if frame.len() < 5 {
            debug!("malformed button frame, dropping");
            return;
        }
        let current = frame[3];
        let previous = frame[4];

        let mut cache = self.buttons.lock().unwrap();
        // Always the source of truth for the current-held query, even when
        // no discrete event fires.
        cache.last_raw = current;

        let changed = current ^ previous;
        if changed == 0 {
            return;
        }

        if changed & ON_OFF_STATE_MASK != 0 {
            let event = if current & ON_OFF_STATE_MASK != 0 {
                EVENT_ON_OFF_PRESS
            } else {
                EVENT_ON_OFF_RELEASE
            };
            cache.ring.push(event);
        } else if changed & LEVER_STATE_MASK != 0 {
            let event = if current & LEVER_STATE_MASK != 0 {
                EVENT_LEVER_LEFT
            } else {
                EVENT_LEVER_RIGHT
            };
            cache.ring.push(event);
        } else {
            let pressed = changed & current & MAIN_BUTTON_MASK;
            if pressed != 0 {
                cache.ring.push(pressed);
            }
        }
    }

    // --- consumption API (engine / orchestrator side) ---

    pub fn clear_ack(&self) {
        self.ack_seen.store(false, Ordering::Release);
        self.ack_cmd.store(0, Ordering::Release);
    }

    /// Consumes a pending ACK if it matches the expected command code.
    pub fn take_ack(&self, expected: u8) -> bool {
        if self.ack_seen.load(Ordering::Acquire) && self.ack_cmd.load(Ordering::Acquire) == expected {
            self.ack_seen.store(false, Ordering::Release);
            return true;
        }
        false
    }

    pub fn clear_wake(&self) {
        self.wake_seen.store(false, Ordering::Release);
    }

    pub fn take_wake(&self) -> bool {
        self.wake_seen.swap(false, Ordering::AcqRel)
    }

    /// Consumes the new-time flag.
    pub fn take_new_time(&self) -> bool {
        self.new_time.swap(false, Ordering::AcqRel)
    }

    pub fn time(&self) -> ClockTime {
        *self.time.lock().unwrap()
    }

    pub fn next_button_event(&self) -> Option<u8> {
        self.buttons.lock().unwrap().ring.pop()
    }

    pub fn button_state(&self) -> u8 {
        self.buttons.lock().unwrap().last_raw
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.configured.store(false, Ordering::Release);
    }

    pub fn mark_configured(&self) {
        self.connected.store(true, Ordering::Release);
        self.configured.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.clear_ack();
        self.clear_wake();
        self.new_time.store(false, Ordering::Release);
        self.mark_disconnected();
        let mut cache = self.buttons.lock().unwrap();
        cache.ring.clear();
        cache.last_raw = 0;
    }
}
