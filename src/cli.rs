//! CLI surface of the host process.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::debug;

/// Process exit codes, per the documented command-line contract.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const INVALID_ARGUMENTS: i32 = 1;
    pub const FATAL_INIT_ERROR: i32 = 2;
}

#[derive(Parser, Debug)]
#[command(name = "lithiumd", about = "Concurrency and orchestration core for automated imaging", version)]
pub struct Cli {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Bind port.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Path to the main configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to search for device drivers (overrides `LITHIUM_MODULE_DIR`).
    #[arg(long)]
    pub module_path: Option<PathBuf>,

    /// Enable the web control panel.
    #[arg(long, default_value_t = false)]
    pub web_panel: bool,

    /// Enable the interactive debug terminal.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Additional log sink path, beyond the default `logs/` directory.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn parse_checked() -> Result<Self, clap::Error> {
        debug!("Cli::parse_checked: called");
        Cli::try_parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_contract() {
        let cli = Cli::parse_from(["lithiumd"]);
        assert_eq!(cli.host, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(cli.port, 8000);
        assert!(!cli.web_panel);
        assert!(!cli.debug);
    }

    #[test]
    fn overrides_are_parsed() {
        let cli = Cli::parse_from(["lithiumd", "--host", "127.0.0.1", "--port", "9001", "--web-panel", "--debug"]);
        assert_eq!(cli.host, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(cli.port, 9001);
        assert!(cli.web_panel);
        assert!(cli.debug);
    }

    #[test]
    fn invalid_port_is_a_parse_error() {
        let result = Cli::try_parse_from(["lithiumd", "--port", "not-a-number"]);
        assert!(result.is_err());
    }
}
