//! Hub configuration: CLI flags and environment
//!
//! Modes combine freely. With none of the `--*-only` flags given, all
//! three are enabled; each flag restricts the hub to the named mode, and
//! several flags together enable exactly that set.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Which subsystems this hub runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modes {
    /// Circuit relay for NAT-bound peers (a transport-level switch).
    pub relay: bool,
    /// The `/y-sync/1.0.0` protocol handler and gossip bridge.
    pub sync: bool,
    /// Proactive content pinning plus the block upload endpoint.
    pub mirror: bool,
}

impl Modes {
    pub fn all() -> Self {
        Self {
            relay: true,
            sync: true,
            mirror: true,
        }
    }
}

/// Command line for the hub daemon.
#[derive(Debug, Parser)]
#[command(name = "windrop-hub", about = "Always-on windrop room hub")]
pub struct HubArgs {
    /// Run only the relay.
    #[arg(long)]
    pub relay_only: bool,

    /// Run only the sync protocol handler.
    #[arg(long)]
    pub sync_only: bool,

    /// Run only the content mirror.
    #[arg(long)]
    pub mirror_only: bool,

    /// UDP port for the QUIC endpoint.
    #[arg(long, env = "PORT", default_value_t = 4001)]
    pub port: u16,

    /// TCP fallback port.
    #[arg(long, env = "TCP_PORT", default_value_t = 4002)]
    pub tcp_port: u16,

    /// Port for the block upload endpoint.
    #[arg(long, env = "HTTP_PORT", default_value_t = 8081)]
    pub http_port: u16,

    /// Directory for room state and the embedded database.
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,
}

impl HubArgs {
    pub fn modes(&self) -> Modes {
        if !self.relay_only && !self.sync_only && !self.mirror_only {
            return Modes::all();
        }
        Modes {
            relay: self.relay_only,
            sync: self.sync_only,
            mirror: self.mirror_only,
        }
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.http_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_enables_everything() {
        let args = HubArgs::parse_from(["windrop-hub"]);
        assert_eq!(args.modes(), Modes::all());
    }

    #[test]
    fn single_flag_restricts() {
        let args = HubArgs::parse_from(["windrop-hub", "--sync-only"]);
        let modes = args.modes();
        assert!(modes.sync);
        assert!(!modes.relay);
        assert!(!modes.mirror);
    }

    #[test]
    fn flags_combine() {
        let args = HubArgs::parse_from(["windrop-hub", "--sync-only", "--mirror-only"]);
        let modes = args.modes();
        assert!(modes.sync);
        assert!(modes.mirror);
        assert!(!modes.relay);
    }

    #[test]
    fn ports_parse() {
        let args = HubArgs::parse_from(["windrop-hub", "--port", "5001", "--http-port", "9090"]);
        assert_eq!(args.port, 5001);
        assert_eq!(args.http_addr().port(), 9090);
    }
}
