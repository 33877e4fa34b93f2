use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

mod bus;
mod channel;
mod cli;
mod command;
mod crc;
mod dgt;
mod error;
mod event;
mod recovery;
mod repeat;
mod ring;
mod stats;
mod task;

use bus::SerialClockPort;
use channel::GatewayChannels;
use command::RawCommand;
use dgt::{Dgt3000, EngineConfig};
use task::GatewayTask;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = cli::Cli::parse();

    let tx = bus::open_bus(&args.bus.cmd_dev, args.bus.baud)?;
    let rx_port = bus::open_bus(&args.bus.rx_dev, args.bus.baud)?;
    let rx_ctl = rx_port.try_clone().context("clone receive bus handle")?;

    let engine = Arc::new(Dgt3000::new(
        Box::new(SerialClockPort::new(tx, rx_ctl)),
        EngineConfig::default(),
    ));
    bus::spawn_rx_pump(rx_port, engine.rx())?;

    let channels = Arc::new(GatewayChannels::new());
    let task = GatewayTask::new(
        Arc::clone(&engine),
        Arc::clone(&channels),
        args.task.to_config(),
    );
    task.initialize()?;
    task.start()?;

    // Outbound pump: events and responses to stdout, one JSON document
    // per line, the same surface a wireless transport would notify on.
    let outbound = Arc::clone(&channels);
    thread::Builder::new()
        .name("host-tx".into())
        .spawn(move || {
            let stdout = io::stdout();
            loop {
                if let Some(event) = outbound.recv_event(Duration::from_millis(20)) {
                    let mut out = stdout.lock();
                    let _ = writeln!(out, "{}", event.to_json());
                }
                while let Some(response) = outbound.recv_response(Duration::ZERO) {
                    let mut out = stdout.lock();
                    let _ = writeln!(out, "{}", response.to_json());
                }
            }
        })
        .context("spawn host output pump")?;

    // The stdin line stream stands in for the wireless transport:
    // stream start connects, EOF disconnects.
    task.on_transport_connected();
    for line in io::stdin().lock().lines() {
        let line = line.context("read command line")?;
        if line.trim().is_empty() {
            continue;
        }
        if !channels.send_command(RawCommand::new(line), Duration::from_millis(1000)) {
            warn!("inbound command dropped, queue full");
        }
    }

    info!("input stream closed, shutting down");
    task.on_transport_disconnected();
    task.stop();
    let status = task.status();
    info!(
        "final status: {}",
        serde_json::to_string(&status).unwrap_or_default()
    );
    channels.flush_all();
    Ok(())
}
