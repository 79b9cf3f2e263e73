// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;

/// In-memory simplex messaging broker.
#[derive(Debug, Parser)]
#[command(name = "smpd", version, about)]
pub struct Config {
    /// TCP port to listen on.
    #[arg(long, env = "SMPD_PORT", default_value = "5223")]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "SMPD_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bound of every in-process queue: session inbound/outbound, the
    /// subscription feed, and each per-queue message FIFO.
    #[arg(long, env = "SMPD_QUEUE_SIZE", default_value = "16")]
    pub queue_size: usize,

    /// Length in bytes of generated recipient/sender ids.
    #[arg(long, env = "SMPD_QUEUE_ID_BYTES", default_value = "12")]
    pub queue_id_bytes: usize,

    /// Length in bytes of generated message ids.
    #[arg(long, env = "SMPD_MSG_ID_BYTES", default_value = "24")]
    pub msg_id_bytes: usize,

    /// Log format (json or text).
    #[arg(long, env = "SMPD_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "SMPD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_size == 0 {
            anyhow::bail!("--queue-size must be at least 1");
        }
        if self.queue_id_bytes == 0 {
            anyhow::bail!("--queue-id-bytes must be at least 1");
        }
        if self.msg_id_bytes == 0 {
            anyhow::bail!("--msg-id-bytes must be at least 1");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    /// Config for tests: loopback, ephemeral port, small queues.
    pub fn test() -> Self {
        Self {
            port: 0,
            host: "127.0.0.1".into(),
            queue_size: 8,
            queue_id_bytes: 12,
            msg_id_bytes: 24,
            log_format: "text".into(),
            log_level: "warn".into(),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
