//! Bus seam between the protocol engine and the physical transport.
//!
//! The clock sits on a dual-bus link: one bus carries outbound commands,
//! the other delivers acknowledgments and unsolicited traffic to whichever
//! listen address the engine has bound. Over serial, each side is a bridge
//! adapter; inbound frames arrive length-prefixed and the listen address
//! is selected with the adapter's `A5 <addr>` escape.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use serialport::SerialPort;

use crate::dgt::RxShared;
use crate::error::DgtError;

/// Adapter escape byte preceding a listen-address select.
const CTL_REBIND: u8 = 0xA5;

/// Largest inbound frame the pump will accept.
pub const RX_FRAME_MAX: usize = 256;

/// What the engine needs from the physical link: a command-transmit path
/// and a rebindable receive endpoint. Unsolicited frames are delivered
/// out-of-band through [`RxShared`], not through this trait.
pub trait ClockPort: Send {
    /// Transmit one framed command to the given bus address.
    fn transmit(&mut self, target: u8, frame: &[u8]) -> Result<(), DgtError>;

    /// Tear down and rebind the receive endpoint to `listen`. The engine
    /// guarantees idempotence and the settling delay at its own layer.
    fn rebind(&mut self, listen: u8) -> Result<(), DgtError>;
}

/// Serial-backed dual-bus port.
pub struct SerialClockPort {
    tx: Box<dyn SerialPort>,
    rx_ctl: Box<dyn SerialPort>,
}

impl SerialClockPort {
    pub fn new(tx: Box<dyn SerialPort>, rx_ctl: Box<dyn SerialPort>) -> Self {
        Self { tx, rx_ctl }
    }
}

impl ClockPort for SerialClockPort {
    fn transmit(&mut self, target: u8, frame: &[u8]) -> Result<(), DgtError> {
        if frame.len() > u8::MAX as usize {
            return Err(DgtError::BufferOverrun);
        }
        let mut out = Vec::with_capacity(frame.len() + 2);
        out.push(target);
        out.push(frame.len() as u8);
        out.extend_from_slice(frame);
        self.tx.write_all(&out).map_err(|e| {
            warn!("command bus write failed: {e}");
            DgtError::I2cComm
        })
    }

    fn rebind(&mut self, listen: u8) -> Result<(), DgtError> {
        self.rx_ctl.write_all(&[CTL_REBIND, listen]).map_err(|e| {
            warn!("receive bus rebind to {listen:#04x} failed: {e}");
            DgtError::I2cInit
        })
    }
}

/// Opens one side of the link at the fixed bus clock rate, 8N1.
pub fn open_bus(dev: &str, baud: u32) -> Result<Box<dyn SerialPort>> {
    serialport::new(dev, baud)
        .timeout(Duration::from_millis(100))
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()
        .with_context(|| format!("open {dev}"))
}

/// Spawns the receive pump: reads length-prefixed frames off the receive
/// bus and hands them to the engine's receive handler. This thread is the
/// interrupt-like context of the system; it never takes the engine's
/// command-path lock.
pub fn spawn_rx_pump(mut port: Box<dyn SerialPort>, rx: Arc<RxShared>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("dgt-rx".into())
        .spawn(move || {
            let mut frame = [0u8; RX_FRAME_MAX];
            loop {
                let mut len_byte = [0u8; 1];
                match port.read_exact(&mut len_byte) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                    Err(e) => {
                        warn!("receive bus read failed, pump exiting: {e}");
                        return;
                    }
                }
                let len = len_byte[0] as usize;
                if len == 0 || len > RX_FRAME_MAX {
                    debug!("dropping frame with bad length {len}");
                    continue;
                }
                if let Err(e) = read_frame(&mut port, &mut frame[..len]) {
                    warn!("short read on receive bus: {e}");
                    continue;
                }
                rx.on_frame(&frame[..len]);
            }
        })
        .context("spawn receive pump thread")
}

fn read_frame(port: &mut Box<dyn SerialPort>, buf: &mut [u8]) -> std::io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match port.read(&mut buf[filled..]) {
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
