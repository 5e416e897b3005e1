use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use clap::Parser;
use nodectl_protocol::{DEFAULT_PORT, DEFAULT_SHELL, PORT_FILE};
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "nodectld", about = "Guest control daemon: file transfer and shell exec over vsock")]
pub struct Cli {
    /// File holding the vsock port to listen on.
    #[arg(long, default_value = PORT_FILE)]
    pub port_file: PathBuf,

    /// Listen on this port and ignore the port file.
    #[arg(long)]
    pub port: Option<u32>,

    /// Shell used to run exec commands (`<shell> -c <line>`).
    #[arg(long, default_value = DEFAULT_SHELL)]
    pub shell: PathBuf,

    /// Listen on TCP <tcp-addr>:<port> when vsock cannot be bound
    /// (development without a vsock transport). There is no authentication:
    /// anyone who can reach that address gets a shell.
    #[arg(long)]
    pub tcp_fallback: bool,

    /// Address for the TCP fallback. Only set this to a non-loopback
    /// address (e.g. 0.0.0.0) on a network you trust.
    #[arg(long, default_value = "127.0.0.1", requires = "tcp_fallback")]
    pub tcp_addr: IpAddr,
}

/// Runtime settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u32,
    pub shell: PathBuf,
    /// TCP address to fall back to when vsock is unavailable.
    pub tcp_fallback: Option<IpAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            shell: PathBuf::from(DEFAULT_SHELL),
            tcp_fallback: None,
        }
    }
}

impl Config {
    pub fn from_cli(cli: Cli) -> Self {
        let port = cli.port.unwrap_or_else(|| read_port_file(&cli.port_file));
        Self {
            port,
            shell: cli.shell,
            tcp_fallback: cli.tcp_fallback.then_some(cli.tcp_addr),
        }
    }
}

/// Read the listening port from `path`, falling back to [`DEFAULT_PORT`]
/// when the file is missing or does not hold a positive port number.
pub fn read_port_file(path: &Path) -> u32 {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %path.display(), error = %e, default = DEFAULT_PORT, "port file unreadable, using default port");
            return DEFAULT_PORT;
        }
    };

    match parse_port(&content) {
        Some(port) => port,
        None => {
            warn!(
                path = %path.display(),
                content = %content.trim(),
                default = DEFAULT_PORT,
                "invalid port in port file, using default port"
            );
            DEFAULT_PORT
        }
    }
}

fn parse_port(content: &str) -> Option<u32> {
    let n: i64 = content.trim().parse().ok()?;
    if n <= 0 {
        return None;
    }
    u32::try_from(n).ok()
}
