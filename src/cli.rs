use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use clap::{Parser, ValueEnum};

/// An IPv4 `host:port` target, as given on the command line.
///
/// `localhost` is rewritten to `127.0.0.1`; everything else must be a
/// dotted-quad address. Port 0 is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host_str, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("'{s}' is not host:port"))?;

        let host = if host_str == "localhost" {
            Ipv4Addr::LOCALHOST
        } else {
            host_str
                .parse::<Ipv4Addr>()
                .map_err(|_| format!("'{host_str}' is not an IPv4 address"))?
        };

        let port: u32 = port_str
            .parse()
            .map_err(|_| format!("'{port_str}' is not a valid port"))?;
        if port == 0 || port > 65535 {
            return Err(format!("port {port} out of range (1-65535)"));
        }

        Ok(Endpoint {
            host,
            port: port as u16,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

#[derive(Parser, Debug)]
#[command(
    name = "gen-app",
    version,
    about = "TCP load generator (client) / drain server"
)]
pub struct GenArgs {
    /// Address to listen on (server) or connect to (client), host:port
    #[arg(long, value_parser = parse_endpoint)]
    pub addr: Endpoint,

    /// Run as the drain server or the generating client
    #[arg(long)]
    pub mode: Mode,

    /// Number of concurrent outbound connections (client mode)
    #[arg(long, default_value_t = 1, value_parser = validate_connections)]
    pub connections: usize,

    /// Seed for the payload-size generator (client mode)
    #[arg(long, default_value_t = 1)]
    pub seed: u32,
}

#[derive(Parser, Debug)]
#[command(
    name = "sniffer",
    version,
    about = "Per-flow TCP/IPv4 throughput monitor for a live interface"
)]
pub struct SnifferArgs {
    /// Network interface to capture on
    #[arg(long)]
    pub interface: String,

    /// Write a call-indented trace file under logs/
    #[arg(long)]
    pub log: bool,
}

fn parse_endpoint(s: &str) -> Result<Endpoint, String> {
    s.parse()
}

fn validate_connections(s: &str) -> Result<usize, String> {
    let val: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == 0 {
        Err("connections must be greater than 0".to_string())
    } else {
        Ok(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_gen(args: &[&str]) -> Result<GenArgs, clap::Error> {
        GenArgs::try_parse_from(args)
    }

    // Required flags present -> parses with defaults.
    #[test]
    fn gen_minimal_server() {
        let cli = parse_gen(&["gen-app", "--addr", "127.0.0.1:8000", "--mode", "server"]).unwrap();
        assert_eq!(cli.addr.host, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(cli.addr.port, 8000);
        assert_eq!(cli.mode, Mode::Server);
        assert_eq!(cli.connections, 1);
        assert_eq!(cli.seed, 1);
    }

    #[test]
    fn gen_client_with_pool_options() {
        let cli = parse_gen(&[
            "gen-app",
            "--addr",
            "10.0.0.5:9000",
            "--mode",
            "client",
            "--connections",
            "16",
            "--seed",
            "1337",
        ])
        .unwrap();
        assert_eq!(cli.mode, Mode::Client);
        assert_eq!(cli.connections, 16);
        assert_eq!(cli.seed, 1337);
    }

    // localhost is rewritten to the loopback address.
    #[test]
    fn gen_localhost_rewrite() {
        let cli = parse_gen(&["gen-app", "--addr", "localhost:80", "--mode", "client"]).unwrap();
        assert_eq!(cli.addr.host, Ipv4Addr::LOCALHOST);
        assert_eq!(cli.addr.port, 80);
    }

    #[test]
    fn gen_missing_addr_rejected() {
        assert!(parse_gen(&["gen-app", "--mode", "server"]).is_err());
    }

    #[test]
    fn gen_missing_mode_rejected() {
        assert!(parse_gen(&["gen-app", "--addr", "127.0.0.1:8000"]).is_err());
    }

    #[test]
    fn gen_invalid_mode_rejected() {
        assert!(parse_gen(&["gen-app", "--addr", "127.0.0.1:8000", "--mode", "proxy"]).is_err());
    }

    #[test]
    fn gen_zero_connections_rejected() {
        let res = parse_gen(&[
            "gen-app",
            "--addr",
            "127.0.0.1:8000",
            "--mode",
            "client",
            "--connections",
            "0",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn endpoint_hostname_rejected() {
        assert!("example.com:80".parse::<Endpoint>().is_err());
    }

    #[test]
    fn endpoint_port_zero_rejected() {
        assert!("127.0.0.1:0".parse::<Endpoint>().is_err());
    }

    #[test]
    fn endpoint_port_out_of_range_rejected() {
        assert!("127.0.0.1:65536".parse::<Endpoint>().is_err());
        assert!("127.0.0.1:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn endpoint_missing_colon_rejected() {
        assert!("127.0.0.1".parse::<Endpoint>().is_err());
    }

    #[test]
    fn endpoint_max_port_accepted() {
        let ep: Endpoint = "1.2.3.4:65535".parse().unwrap();
        assert_eq!(ep.port, 65535);
        assert_eq!(ep.to_string(), "1.2.3.4:65535");
    }

    fn parse_sniffer(args: &[&str]) -> Result<SnifferArgs, clap::Error> {
        SnifferArgs::try_parse_from(args)
    }

    #[test]
    fn sniffer_interface_required() {
        assert!(parse_sniffer(&["sniffer"]).is_err());
        let cli = parse_sniffer(&["sniffer", "--interface", "eth0"]).unwrap();
        assert_eq!(cli.interface, "eth0");
        assert!(!cli.log);
    }

    #[test]
    fn sniffer_log_flag() {
        let cli = parse_sniffer(&["sniffer", "--interface", "lo", "--log"]).unwrap();
        assert!(cli.log);
    }
}
