use std::process::ExitCode;

use clap::error::ErrorKind as ClapErrorKind;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use smtp_socks_r::config::{Config, USAGE_EXIT_CODE};
use smtp_socks_r::io::accept_one;
use smtp_socks_r::{run_session, Outcome, SessionOptions, StdioConn};

fn init_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(log_level.parse()?)
                .from_env()?,
        )
        .try_init()?;
    Ok(())
}

/// Serve one session either on stdin/stdout or on the first client accepted
/// from `config.listen`.
fn serve(config: &Config, options: &SessionOptions) -> smtp_socks_r::Result<Outcome> {
    match config.listen {
        Some(addr) => {
            info!(%addr, "waiting for one client");
            let (mut client, peer) = accept_one(addr)?;
            info!(%peer, "client connected");
            run_session(&mut client, options)
        }
        None => {
            let mut client = StdioConn::new()?;
            run_session(&mut client, options)
        }
    }
}

fn main() -> ExitCode {
    let config = match Config::from_args(std::env::args_os()) {
        Ok(config) => config,
        Err(e) => {
            return match e.kind() {
                ClapErrorKind::DisplayVersion => {
                    let _ = e.print();
                    ExitCode::SUCCESS
                }
                ClapErrorKind::DisplayHelp => {
                    eprint!("{}", e.render());
                    ExitCode::from(USAGE_EXIT_CODE)
                }
                _ => {
                    let _ = e.print();
                    ExitCode::from(USAGE_EXIT_CODE)
                }
            };
        }
    };

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("failed to initialise logging: {}", e);
        return ExitCode::FAILURE;
    }

    let options = config.session_options();
    match serve(&config, &options) {
        Ok(outcome) => {
            debug!(?outcome, "session finished");
            if outcome.is_failure() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "session aborted");
            ExitCode::FAILURE
        }
    }
}
