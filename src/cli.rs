use std::time::Duration;

use clap::{Args, Parser};

use crate::task::TaskConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "dgt-gateway", about = "DGT3000 chess clock gateway (dual-bus bridge)")]
pub struct Cli {
    #[command(flatten)]
    pub bus: BusOpts,
    #[command(flatten)]
    pub task: TaskOpts,
}

#[derive(Args, Debug, Clone)]
pub struct BusOpts {
    /// Command bus bridge device
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub cmd_dev: String,
    /// Receive bus bridge device
    #[arg(long, default_value = "/dev/ttyUSB1")]
    pub rx_dev: String,
    /// Baud rate for both bridge adapters
    #[arg(long, default_value_t = 115_200)]
    pub baud: u32,
}

#[derive(Args, Debug, Clone)]
pub struct TaskOpts {
    /// Control loop period in milliseconds
    #[arg(long, default_value_t = 10)]
    pub tick_ms: u64,
    /// Minimum delay between recovery attempts in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub recovery_delay_ms: u64,
    /// Recovery attempt ceiling, 0 = unlimited
    #[arg(long, default_value_t = 0)]
    pub max_recovery_attempts: u32,
}

impl TaskOpts {
    pub fn to_config(&self) -> TaskConfig {
        TaskConfig {
            tick_period: Duration::from_millis(self.tick_ms),
            recovery_delay: Duration::from_millis(self.recovery_delay_ms),
            max_recovery_attempts: self.max_recovery_attempts,
        }
    }
}
