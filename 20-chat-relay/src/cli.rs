use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;

use crate::{codec::DEFAULT_MAX_FRAME_LEN, config::RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay chat messages between TCP clients", long_about = None)]
pub struct Cli {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:50000")]
    pub listen: SocketAddr,

    /// JSON file holding accounts. Without it accounts only live in memory.
    #[arg(long)]
    pub accounts: Option<PathBuf>,

    /// Length of the pending-connection queue.
    #[arg(long, default_value_t = 5)]
    pub backlog: u32,

    /// Seconds the first accept may stay idle before checking for clients.
    #[arg(long, default_value_t = 180)]
    pub initial_idle_secs: u64,

    /// Seconds of idle accept between later checks.
    #[arg(long, default_value_t = 120)]
    pub idle_secs: u64,

    /// Largest inbound frame accepted, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,
}

impl Cli {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            listen: self.listen,
            backlog: self.backlog,
            initial_idle_timeout: Duration::from_secs(self.initial_idle_secs),
            idle_timeout: Duration::from_secs(self.idle_secs),
            max_frame_len: self.max_frame_bytes,
            ..RelayConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_relay_config() {
        let cli = Cli::parse_from(["chat-relay"]);
        let config = cli.relay_config();
        let defaults = RelayConfig::default();

        assert_eq!(config.listen, defaults.listen);
        assert_eq!(config.backlog, defaults.backlog);
        assert_eq!(config.initial_idle_timeout, defaults.initial_idle_timeout);
        assert_eq!(config.idle_timeout, defaults.idle_timeout);
        assert_eq!(config.max_frame_len, defaults.max_frame_len);
        assert!(cli.accounts.is_none());
    }

    #[test]
    fn flags_override_timeouts() {
        let cli = Cli::parse_from([
            "chat-relay",
            "--listen",
            "127.0.0.1:0",
            "--initial-idle-secs",
            "3",
            "--idle-secs",
            "1",
            "--accounts",
            "/tmp/accounts.json",
        ]);
        let config = cli.relay_config();

        assert_eq!(config.listen.port(), 0);
        assert_eq!(config.initial_idle_timeout, Duration::from_secs(3));
        assert_eq!(config.idle_timeout, Duration::from_secs(1));
        assert_eq!(cli.accounts, Some(PathBuf::from("/tmp/accounts.json")));
    }
}
