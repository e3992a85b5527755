//! Command-line configuration.

use std::ffi::OsString;
use std::net::SocketAddr;

use clap::{builder::PossibleValuesParser, value_parser};

use crate::session::{SessionOptions, DEFAULT_PROXY_HOST, DEFAULT_PROXY_PORT};

/// Default log level when neither `--log-level` nor `RUST_LOG` says otherwise.
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Exit status for usage errors and `--help`.
pub const USAGE_EXIT_CODE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub proxy_host: String,
    pub proxy_port: u16,
    /// Serve a single TCP client accepted here instead of stdin/stdout.
    pub listen: Option<SocketAddr>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_host: DEFAULT_PROXY_HOST.to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            listen: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

pub fn command() -> clap::Command {
    clap::Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about("Speak just enough SMTP to open a SOCKS5 tunnel to the requested mail host")
        .arg(
            clap::Arg::new("proxy-host")
                .help("SOCKS5 proxy host")
                .default_value(DEFAULT_PROXY_HOST)
                .value_parser(value_parser!(String)),
        )
        .arg(
            clap::Arg::new("proxy-port")
                .help("SOCKS5 proxy port")
                .default_value("9050")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            clap::Arg::new("log-level")
                .short('l')
                .long("log-level")
                .help("Set log level")
                .default_value(DEFAULT_LOG_LEVEL)
                .value_parser(PossibleValuesParser::new([
                    "error", "warn", "info", "debug", "trace",
                ]))
                .num_args(1),
        )
        .arg(
            clap::Arg::new("listen")
                .long("listen")
                .help("Accept one TCP client on this address instead of using stdin/stdout")
                .value_parser(value_parser!(SocketAddr))
                .num_args(1),
        )
}

impl Config {
    /// Parse from an argument list whose first item is the program name.
    pub fn from_args<I, T>(args: I) -> Result<Config, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = command().try_get_matches_from(args)?;
        Ok(Config {
            proxy_host: matches
                .get_one::<String>("proxy-host")
                .cloned()
                .unwrap_or_else(|| DEFAULT_PROXY_HOST.to_string()),
            proxy_port: matches
                .get_one::<u16>("proxy-port")
                .copied()
                .unwrap_or(DEFAULT_PROXY_PORT),
            listen: matches.get_one::<SocketAddr>("listen").copied(),
            log_level: matches
                .get_one::<String>("log-level")
                .cloned()
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            proxy_host: self.proxy_host.clone(),
            proxy_port: self.proxy_port,
            ..SessionOptions::default()
        }
    }
}
