//! Deadline-bounded reads.
//!
//! Both primitives share one wall-clock budget across all of their wait/read
//! rounds: a slow peer that keeps making progress is tolerated, but the call
//! as a whole never outlives its budget and never returns a partial result.

use std::io::{self, Read};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::io::wait_readable;

/// Shrinking time allowance owned by a single read operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    budget: Duration,
    /// `None` when `budget` reaches past the range of `Instant`.
    expires: Option<Instant>,
}

impl Deadline {
    /// Start a budget of `budget` from now.
    pub fn after(budget: Duration) -> Self {
        let now = Instant::now();
        Self {
            budget,
            expires: now.checked_add(budget),
        }
    }

    /// Time left, or `None` once the budget is spent. An expired deadline
    /// stays expired.
    pub fn remaining(&self) -> Option<Duration> {
        match self.expires {
            Some(expires) => expires
                .checked_duration_since(Instant::now())
                .filter(|left| !left.is_zero()),
            None => Some(Duration::MAX),
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Wait for `fd` to become readable within the remaining budget.
    pub fn wait<F: AsFd + ?Sized>(&self, fd: &F) -> Result<()> {
        loop {
            let left = self.remaining().ok_or(Error::TimedOut {
                waited: self.budget,
            })?;
            match wait_readable(fd.as_fd(), Some(left)) {
                Ok(true) => return Ok(()),
                Ok(false) if self.expires.is_none() => continue,
                Ok(false) => {
                    return Err(Error::TimedOut {
                        waited: self.budget,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// One read that treats end-of-stream as an error.
fn read_some<S: Read + ?Sized>(stream: &mut S, buf: &mut [u8]) -> Result<usize> {
    loop {
        match stream.read(buf) {
            Ok(0) => return Err(Error::Closed),
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Read exactly `n` bytes within `timeout`.
///
/// All-or-nothing: returns `TimedOut` if the budget runs out first and
/// `Closed` if the peer ends the stream first, never a short buffer.
pub fn read_exact_with_timeout<S>(stream: &mut S, n: usize, timeout: Duration) -> Result<Vec<u8>>
where
    S: Read + AsFd + ?Sized,
{
    let deadline = Deadline::after(timeout);
    let mut buf = vec![0u8; n];
    let mut got = 0;

    while got < n {
        deadline.wait(stream)?;
        got += read_some(stream, &mut buf[got..])?;
    }

    Ok(buf)
}

/// Read one line of at most `max_len` bytes within `timeout`.
///
/// The returned bytes exclude the `\n` terminator and a `\r` directly before
/// it. Bytes that arrived in the same read after the terminator are dropped.
/// `Overflow` is returned when `max_len` bytes arrive without a terminator.
pub fn read_line_with_timeout<S>(
    stream: &mut S,
    max_len: usize,
    timeout: Duration,
) -> Result<Vec<u8>>
where
    S: Read + AsFd + ?Sized,
{
    let deadline = Deadline::after(timeout);
    let mut buf = vec![0u8; max_len];
    let mut got = 0;

    while got < max_len {
        deadline.wait(stream)?;
        let n = read_some(stream, &mut buf[got..])?;

        if let Some(pos) = buf[got..got + n].iter().position(|&b| b == b'\n') {
            let mut end = got + pos;
            if end > 0 && buf[end - 1] == b'\r' {
                end -= 1;
            }
            buf.truncate(end);
            return Ok(buf);
        }
        got += n;
    }

    Err(Error::Overflow { capacity: max_len })
}
