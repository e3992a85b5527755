//! smtp-socks-r - an SMTP front end that tunnels mail sessions through SOCKS5
//!
//! The client (usually an MTA talking over stdin/stdout) is greeted, then
//! names its own host and the destination mail host in a single
//! `EHLO`/`HELO` line:
//!
//! ```text
//! S: 220 Welcome
//! C: EHLO mybox.onion target.example.com
//!                            (SOCKS5 CONNECT target.example.com:25)
//!                            (upstream: 220 target.example.com ESMTP)
//!                            (sent upstream: EHLO mybox.onion)
//! S: 250-target.example.com ...
//! ```
//!
//! From then on bytes are relayed untouched in both directions, honouring
//! half-close, until both sides have finished.
//!
//! # Example
//!
//! ```no_run
//! use smtp_socks_r::{run_session, SessionOptions, StdioConn};
//!
//! let mut client = StdioConn::new()?;
//! let options = SessionOptions::default();
//! let outcome = run_session(&mut client, &options)?;
//! println!("{:?}", outcome);
//! # Ok::<(), smtp_socks_r::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod relay;
pub mod session;
pub mod socks5;
pub mod timed;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use io::{Conn, StdioConn};
pub use relay::{relay, RelayStats};
pub use session::{parse_command, run_session, Command, Outcome, Session, SessionOptions};
pub use socks5::{dial_via_socks5, Socks5Dialer};
pub use timed::{read_exact_with_timeout, read_line_with_timeout, Deadline};
