//! §6 CLI surface. Ambient configuration layer, needed even though argument
//! parsing is named as an external-collaborator concern in §1; `clap`'s
//! derive API is the same one this binary has always used for flag
//! parsing.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "bitlurker", about = "Passive BitTorrent Mainline DHT crawler")]
pub struct Cli {
    /// listen on given address (default all, ipv4)
    #[arg(short, long, default_value = "0.0.0.0")]
    pub addr: String,

    /// listen on given port, -1 => random in 6000-6999
    #[arg(short, long, default_value_t = -1)]
    pub port: i32,

    /// max friends to make with per second
    #[arg(short, long, default_value_t = 500)]
    pub friends: u32,

    /// max peers to connect to for metadata fetches
    #[arg(short = 'e', long, default_value_t = 400)]
    pub peers: usize,

    /// max time allowed per metadata fetch attempt, in seconds
    #[arg(short, long, default_value_t = 30)]
    pub timeout: u64,

    /// run in verbose mode
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// http query-surface port (external collaborator, §1 Non-goal; accepted and stored only)
    #[arg(short = 'H', long, default_value_t = 0)]
    pub http_port: u16,

    /// max retries per announcement before blacklisting the peer
    #[arg(short = 'r', long, default_value_t = 3)]
    pub max_retries: u32,

    /// enable UPnP IGD port mapping (external collaborator, §1 Non-goal; accepted and stored only)
    #[arg(short = 'm', long, default_value_t = false)]
    pub enable_http_port_mapping: bool,
}

impl Cli {
    /// Resolves `port == -1` into a random port in `6000..=6999` (§6).
    pub fn resolved_port(&self) -> u16 {
        if self.port >= 0 {
            self.port as u16
        } else {
            use rand::Rng;
            rand::thread_rng().gen_range(6000..=6999)
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.addr, self.resolved_port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_port_resolves_into_expected_range() {
        let cli = Cli::parse_from(["bitlurker", "--port", "-1"]);
        let port = cli.resolved_port();
        assert!((6000..=6999).contains(&port));
    }

    #[test]
    fn explicit_port_is_used_verbatim() {
        let cli = Cli::parse_from(["bitlurker", "--port", "6881"]);
        assert_eq!(cli.resolved_port(), 6881);
    }
}
