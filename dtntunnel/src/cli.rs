use clap::{Args, Parser, Subcommand};
use dtntunnel_core::control::{TunnelConfig, TunnelSpec};
use dtntunnel_core::proto::Protocol;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "dtntunnel",
    version,
    about = "Tunnel TCP or UDP traffic over a DTN bundle transport"
)]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the tunnel in the foreground
    Run(RunArgs),

    /// Write a default config file (does not overwrite unless --force)
    InitConfig {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the resolved config file path
    PrintConfigPath,
}

/// Command-line overrides for the config file
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Listen mode: only serve flows opened by a remote tunnel
    #[arg(short = 'L', long)]
    pub listen: bool,

    /// Request custody transfer
    #[arg(short = 'c', long)]
    pub custody: bool,

    /// Bundle expiration in seconds
    #[arg(short = 'e', long)]
    pub expiration: Option<u64>,

    /// Tunnel TCP (default)
    #[arg(short = 't', long, conflicts_with = "udp")]
    pub tcp: bool,

    /// Tunnel UDP
    #[arg(short = 'u', long)]
    pub udp: bool,

    /// Local endpoint id override
    #[arg(long)]
    pub local_eid: Option<String>,

    /// Coalescing delay in milliseconds
    #[arg(short = 'D', long)]
    pub delay: Option<u64>,

    /// Maximum bundle size in bytes, header included
    #[arg(short = 'z', long)]
    pub max_size: Option<usize>,

    /// Tunnel spec: [local_host:]local_port:remote_host:remote_port
    #[arg(short = 'T', long)]
    pub tunnel: Option<TunnelSpec>,

    /// Log throughput every N seconds
    #[arg(short = 'm', long)]
    pub monitor: Option<u64>,

    /// Socket receive buffer size
    #[arg(short = 'b', long)]
    pub recv_bufsize: Option<usize>,

    /// Socket send buffer size
    #[arg(short = 'w', long)]
    pub send_bufsize: Option<usize>,

    /// Deliver UDP datagrams strictly in order
    #[arg(short = 'r', long)]
    pub reorder_udp: bool,

    /// Transparent proxy mode (Linux)
    #[arg(short = 'p', long)]
    pub transparent: bool,

    /// Class of service: critical
    #[arg(short = 'C', long)]
    pub critical: bool,

    /// Class of service: streaming
    #[arg(short = 'S', long)]
    pub streaming: bool,

    /// Class of service: reliable
    #[arg(short = 'R', long)]
    pub reliable: bool,

    /// Class of service ordinal (0-254)
    #[arg(short = 'O', long)]
    pub ordinal: Option<u8>,

    /// Class of service flow label
    #[arg(short = 'F', long)]
    pub flow_label: Option<u32>,

    /// Destination endpoint id, or path of a destination table file
    pub destination: Option<String>,
}

impl RunArgs {
    /// Apply the flags that were given on top of `cfg`
    pub fn apply(self, cfg: &mut TunnelConfig) {
        cfg.listen |= self.listen;
        cfg.custody |= self.custody;
        cfg.reorder_udp |= self.reorder_udp;
        cfg.transparent |= self.transparent;
        cfg.ecos.critical |= self.critical;
        cfg.ecos.streaming |= self.streaming;
        cfg.ecos.reliable |= self.reliable;

        if self.udp {
            cfg.protocol = Protocol::Udp;
        } else if self.tcp {
            cfg.protocol = Protocol::Tcp;
        }
        if let Some(secs) = self.expiration {
            cfg.expiration = Duration::from_secs(secs);
        }
        if let Some(v) = self.local_eid {
            cfg.local_eid = Some(v);
        }
        if let Some(ms) = self.delay {
            cfg.delay = Some(Duration::from_millis(ms));
        }
        if let Some(v) = self.max_size {
            cfg.max_size = v;
        }
        if let Some(v) = self.tunnel {
            cfg.tunnel = Some(v);
        }
        if let Some(secs) = self.monitor {
            cfg.stats_interval = Some(Duration::from_secs(secs.max(1)));
        }
        if let Some(v) = self.recv_bufsize {
            cfg.recv_bufsize = v;
        }
        if let Some(v) = self.send_bufsize {
            cfg.send_bufsize = v;
        }
        if let Some(v) = self.ordinal {
            cfg.ecos.ordinal = v;
        }
        if let Some(v) = self.flow_label {
            cfg.ecos.flow_label = Some(v);
        }

        // An argument with a ':' is an endpoint id, anything else a table file
        if let Some(dest) = self.destination {
            if dest.contains(':') {
                cfg.dest_eid = Some(dest);
                cfg.dest_eid_table = None;
            } else {
                cfg.dest_eid_table = Some(PathBuf::from(dest));
                cfg.dest_eid = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["dtntunnel", "run"];
        full.extend_from_slice(argv);
        let cli = Cli::try_parse_from(full).expect("parse");
        match cli.command {
            Some(Command::Run(args)) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_destination_kind() {
        let mut cfg = TunnelConfig::default();
        run_args(&["-T", "8080:10.0.0.5:80", "dtn://far/dtntunnel"]).apply(&mut cfg);
        assert_eq!(cfg.dest_eid.as_deref(), Some("dtn://far/dtntunnel"));
        assert!(cfg.dest_eid_table.is_none());

        let mut cfg = TunnelConfig::default();
        run_args(&["-p", "-T", "8080:10.0.0.5:80", "/etc/dtntunnel/table"]).apply(&mut cfg);
        assert_eq!(cfg.dest_eid_table, Some(PathBuf::from("/etc/dtntunnel/table")));
        assert!(cfg.dest_eid.is_none());
        assert!(cfg.transparent);
    }

    #[test]
    fn test_flags_override_file() {
        let mut cfg = TunnelConfig {
            max_size: 1000,
            ..Default::default()
        };
        run_args(&["-u", "-r", "-D", "50", "-z", "4096", "-m", "5", "-e", "30", "-O", "7"])
            .apply(&mut cfg);

        assert_eq!(cfg.protocol, Protocol::Udp);
        assert!(cfg.reorder_udp);
        assert_eq!(cfg.delay, Some(Duration::from_millis(50)));
        assert_eq!(cfg.max_size, 4096);
        assert_eq!(cfg.stats_interval, Some(Duration::from_secs(5)));
        assert_eq!(cfg.expiration, Duration::from_secs(30));
        assert_eq!(cfg.ecos.ordinal, 7);
        assert!(cfg.ecos.is_enabled());
    }

    #[test]
    fn test_absent_flags_keep_file_values() {
        let mut cfg = TunnelConfig {
            protocol: Protocol::Udp,
            max_size: 1000,
            ..Default::default()
        };
        run_args(&["-L"]).apply(&mut cfg);
        assert!(cfg.listen);
        assert_eq!(cfg.protocol, Protocol::Udp);
        assert_eq!(cfg.max_size, 1000);
    }

    #[test]
    fn test_tcp_and_udp_conflict() {
        assert!(Cli::try_parse_from(["dtntunnel", "run", "-t", "-u"]).is_err());
    }
}
