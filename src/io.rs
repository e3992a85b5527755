//! Stream endpoints and readiness waiting.
//!
//! Every endpoint the relay touches is a [`Conn`]: a blocking byte stream whose
//! read side can be polled through a file descriptor and which may support
//! independent half-close of its two directions.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Bidirectional blocking byte stream.
///
/// `as_fd()` must return the descriptor that becomes readable when `read`
/// would not block.
pub trait Conn: Read + Write + AsFd {
    /// Shutdown one or both directions.
    ///
    /// Endpoints without independent half-close (a pair of pipes) accept the
    /// call and do nothing.
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;
}

impl Conn for TcpStream {
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }
}

impl Conn for UnixStream {
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        UnixStream::shutdown(self, how)
    }
}

/// The process's standard input and output as one endpoint.
///
/// Both descriptors are duplicated so reads and writes bypass the buffered
/// `Stdin`/`Stdout` handles; readiness of fd 0 then matches what `read` sees.
pub struct StdioConn {
    input: File,
    output: File,
}

impl StdioConn {
    pub fn new() -> io::Result<Self> {
        let input = io::stdin().as_fd().try_clone_to_owned()?;
        let output = io::stdout().as_fd().try_clone_to_owned()?;
        Ok(Self {
            input: File::from(input),
            output: File::from(output),
        })
    }
}

impl Read for StdioConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for StdioConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}

impl AsFd for StdioConn {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.input.as_fd()
    }
}

impl Conn for StdioConn {
    fn shutdown(&self, _how: Shutdown) -> io::Result<()> {
        Ok(())
    }
}

/// Bind `addr`, accept exactly one client and close the listening socket
/// before returning it.
pub fn accept_one<A: ToSocketAddrs>(addr: A) -> io::Result<(TcpStream, SocketAddr)> {
    let listener = TcpListener::bind(addr)?;
    listener.accept()
}

/// Convert an optional timeout into poll(2) milliseconds, rounding up so a
/// sub-millisecond remainder still waits instead of returning immediately.
fn poll_timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(t) => {
            let ms = t.as_millis() + u128::from(t.subsec_nanos() % 1_000_000 != 0);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let rc = unsafe {
        libc::poll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            poll_timeout_ms(timeout),
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Wait until `fd` is readable (or hung up) or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout. `EINTR` is returned to the caller as
/// `ErrorKind::Interrupted` so it can recompute its remaining budget.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> io::Result<bool> {
    let mut fds = [libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    Ok(poll(&mut fds, timeout)? > 0)
}

/// Block without timeout until at least one of the given descriptors has an
/// event. `None` entries are skipped by poll(2) and never reported ready.
pub fn poll_pair(
    first: Option<BorrowedFd<'_>>,
    second: Option<BorrowedFd<'_>>,
) -> io::Result<(bool, bool)> {
    let entry = |fd: Option<BorrowedFd<'_>>| libc::pollfd {
        fd: fd.map_or(-1, |fd| fd.as_raw_fd()),
        events: libc::POLLIN,
        revents: 0,
    };
    let mut fds = [entry(first), entry(second)];
    loop {
        match poll(&mut fds, None) {
            Ok(_) => return Ok((fds[0].revents != 0, fds[1].revents != 0)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
