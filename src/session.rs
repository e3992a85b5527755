//! Front-end SMTP command driver.
//!
//! Greets the client, waits for `EHLO`/`HELO <local-name> <remote-host>`,
//! dials `<remote-host>:25` through the SOCKS5 proxy, checks the upstream
//! banner, re-sends the client's greeting with its local name, and then
//! relays raw bytes until both sides close.

use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::io::Conn;
use crate::relay::{relay, RelayStats, DEFAULT_CHUNK_SIZE};
use crate::socks5::{Socks5Dialer, DEFAULT_NEGOTIATION_TIMEOUT};
use crate::timed::read_line_with_timeout;

pub const REPLY_WELCOME: &str = "220 Welcome";
pub const REPLY_CLOSING: &str = "221 closing connection";
pub const REPLY_INVALID: &str = "500 invalid command";
pub const REPLY_TIMED_OUT: &str = "421 connection timed out";
pub const REPLY_NO_CONNECT: &str = "421 could not connect";
pub const REPLY_REJECTED: &str = "421 server seems to not like us";

/// Prefix an upstream banner must carry to be accepted.
const UPSTREAM_READY: &[u8] = b"220 ";

/// Default proxy host
pub const DEFAULT_PROXY_HOST: &str = "localhost";

/// Default proxy port
pub const DEFAULT_PROXY_PORT: u16 = 9050;

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// SOCKS5 proxy host
    pub proxy_host: String,
    /// SOCKS5 proxy port
    pub proxy_port: u16,
    /// Port dialed on the requested remote host
    pub upstream_port: u16,
    /// Budget for each client command line
    pub command_timeout: Duration,
    /// Budget for the upstream banner line
    pub greeting_timeout: Duration,
    /// Budget for connecting to the proxy and for each negotiation read
    pub negotiation_timeout: Duration,
    /// Capacity of a command or banner line, terminator included
    pub line_capacity: usize,
    /// Relay read size
    pub chunk_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            proxy_host: DEFAULT_PROXY_HOST.to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            upstream_port: 25,
            command_timeout: Duration::from_secs(30),
            greeting_timeout: Duration::from_secs(120),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            line_capacity: 255,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// A recognized client command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    /// `EHLO`/`HELO`; `verb` keeps the client's spelling, `args` is the rest
    /// of the line after the verb and its space. Both are the raw bytes the
    /// client sent.
    Hello { verb: Vec<u8>, args: Vec<u8> },
    Invalid,
}

/// Classify one command line. Verbs match case-insensitively.
pub fn parse_command(line: &[u8]) -> Command {
    if line.len() < 4 {
        return Command::Invalid;
    }
    if line[..4].eq_ignore_ascii_case(b"QUIT") {
        return Command::Quit;
    }
    if line.len() >= 5
        && (line[..5].eq_ignore_ascii_case(b"EHLO ") || line[..5].eq_ignore_ascii_case(b"HELO "))
    {
        return Command::Hello {
            verb: line[..4].to_vec(),
            args: line[5..].to_vec(),
        };
    }
    Command::Invalid
}

/// Parsed `EHLO`/`HELO` arguments, kept as the client's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub verb: Vec<u8>,
    pub local_name: Vec<u8>,
    pub remote_host: Vec<u8>,
}

impl Hello {
    /// Split `args` on ASCII whitespace into exactly a local name and a
    /// remote host.
    pub fn parse(verb: &[u8], args: &[u8]) -> Option<Hello> {
        let mut tokens = args
            .split(|b| b.is_ascii_whitespace())
            .filter(|token| !token.is_empty());
        let local_name = tokens.next()?;
        let remote_host = tokens.next()?;
        if tokens.next().is_some() {
            return None;
        }
        Some(Hello {
            verb: verb.to_vec(),
            local_name: local_name.to_vec(),
            remote_host: remote_host.to_vec(),
        })
    }

    /// The line sent upstream once the tunnel is up.
    pub fn upstream_greeting(&self) -> Vec<u8> {
        let mut line = Vec::with_capacity(self.verb.len() + self.local_name.len() + 3);
        line.extend_from_slice(&self.verb);
        line.push(b' ');
        line.extend_from_slice(&self.local_name);
        line.extend_from_slice(b"\r\n");
        line
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Client sent QUIT
    Quit,
    /// No command within the command timeout
    CommandTimeout,
    /// Client closed its side before a tunnel existed
    ClientClosed,
    /// The proxy could not provide a tunnel
    DialFailed,
    /// The target sent no banner in time
    UpstreamSilent,
    /// The target's banner did not start with `220 `
    UpstreamRejected,
    /// The relay ran to completion
    Relayed(RelayStats),
}

impl Outcome {
    /// Whether the session ended because the upstream could not be used.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::DialFailed | Outcome::UpstreamSilent | Outcome::UpstreamRejected
        )
    }
}

enum State {
    Greeting,
    AwaitCommand,
    HeloSeen { verb: Vec<u8>, args: Vec<u8> },
    Dialing(Hello),
    Relaying(TcpStream),
    Close(Outcome),
}

/// One client session over `client`.
pub struct Session<'a, C: Conn + ?Sized> {
    client: &'a mut C,
    options: &'a SessionOptions,
}

impl<'a, C: Conn + ?Sized> Session<'a, C> {
    pub fn new(client: &'a mut C, options: &'a SessionOptions) -> Self {
        Self { client, options }
    }

    /// Drive the session to its end. Errors are I/O failures talking to the
    /// client or during the relay; every other ending is an [`Outcome`].
    pub fn run(mut self) -> Result<Outcome> {
        let mut state = State::Greeting;
        loop {
            state = match state {
                State::Greeting => self.greet()?,
                State::AwaitCommand => self.await_command()?,
                State::HeloSeen { verb, args } => self.helo_seen(&verb, &args)?,
                State::Dialing(hello) => self.dial(hello)?,
                State::Relaying(tunnel) => self.relay(tunnel)?,
                State::Close(outcome) => return Ok(outcome),
            };
        }
    }

    fn reply(&mut self, text: &str) -> Result<()> {
        self.client.write_all(format!("{}\r\n", text).as_bytes())?;
        self.client.flush()?;
        Ok(())
    }

    fn greet(&mut self) -> Result<State> {
        self.reply(REPLY_WELCOME)?;
        Ok(State::AwaitCommand)
    }

    fn await_command(&mut self) -> Result<State> {
        let line = match read_line_with_timeout(
            &mut *self.client,
            self.options.line_capacity,
            self.options.command_timeout,
        ) {
            Ok(line) => line,
            Err(Error::TimedOut { .. }) => {
                self.reply(REPLY_TIMED_OUT)?;
                return Ok(State::Close(Outcome::CommandTimeout));
            }
            Err(Error::Overflow { capacity }) => {
                debug!(capacity, "command line too long");
                self.reply(REPLY_INVALID)?;
                return Ok(State::AwaitCommand);
            }
            Err(Error::Closed) => {
                debug!("client closed before a tunnel was opened");
                return Ok(State::Close(Outcome::ClientClosed));
            }
            Err(e) => return Err(e),
        };

        match parse_command(&line) {
            Command::Quit => {
                self.reply(REPLY_CLOSING)?;
                Ok(State::Close(Outcome::Quit))
            }
            Command::Hello { verb, args } => Ok(State::HeloSeen { verb, args }),
            Command::Invalid => {
                self.reply(REPLY_INVALID)?;
                Ok(State::AwaitCommand)
            }
        }
    }

    fn helo_seen(&mut self, verb: &[u8], args: &[u8]) -> Result<State> {
        match Hello::parse(verb, args) {
            Some(hello) => Ok(State::Dialing(hello)),
            None => {
                debug!(
                    args = %String::from_utf8_lossy(args),
                    "expected <local-name> <remote-host>"
                );
                self.reply(REPLY_INVALID)?;
                Ok(State::AwaitCommand)
            }
        }
    }

    fn dial(&mut self, hello: Hello) -> Result<State> {
        let options = self.options;
        let dialer = Socks5Dialer::new(options.proxy_host.as_str(), options.proxy_port)
            .with_timeout(options.negotiation_timeout);
        let target_host = String::from_utf8_lossy(&hello.remote_host).into_owned();

        let mut tunnel = match dialer.dial(&hello.remote_host, options.upstream_port) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!(
                    target_host = %target_host,
                    proxy = %dialer.proxy_addr(),
                    error = %e,
                    "proxy connection to {} failed",
                    target_host
                );
                self.reply(REPLY_NO_CONNECT)?;
                return Ok(State::Close(Outcome::DialFailed));
            }
        };

        let banner = match read_line_with_timeout(
            &mut tunnel,
            options.line_capacity,
            options.greeting_timeout,
        ) {
            Ok(banner) => banner,
            Err(e) => {
                warn!(
                    target_host = %target_host,
                    error = %e,
                    "no welcome message from {}",
                    target_host
                );
                self.reply(REPLY_NO_CONNECT)?;
                return Ok(State::Close(Outcome::UpstreamSilent));
            }
        };

        if !banner.starts_with(UPSTREAM_READY) {
            warn!(
                target_host = %target_host,
                banner = %String::from_utf8_lossy(&banner),
                "unexpected welcome message from {}",
                target_host
            );
            self.reply(REPLY_REJECTED)?;
            return Ok(State::Close(Outcome::UpstreamRejected));
        }

        tunnel.write_all(&hello.upstream_greeting())?;
        info!(
            target_host = %target_host,
            local_name = %String::from_utf8_lossy(&hello.local_name),
            "tunnel ready, relaying"
        );
        Ok(State::Relaying(tunnel))
    }

    fn relay(&mut self, mut tunnel: TcpStream) -> Result<State> {
        let stats = relay(&mut *self.client, &mut tunnel, self.options.chunk_size)?;
        Ok(State::Close(Outcome::Relayed(stats)))
    }
}

/// Run one session over `client` with `options`.
pub fn run_session<C: Conn + ?Sized>(client: &mut C, options: &SessionOptions) -> Result<Outcome> {
    Session::new(client, options).run()
}
