//! Bidirectional, half-close aware byte pump.
//!
//! A single thread polls whichever endpoints still have an open read side
//! and copies each readable chunk to the opposite endpoint in full. There is
//! no idle timeout: the loop runs until both read sides have reached end of
//! stream or an I/O error occurs.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsFd;

use tracing::debug;

use crate::error::Result;
use crate::io::{poll_pair, Conn};

/// Default number of bytes moved per read.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Byte counters for one relay run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the local endpoint into the tunnel
    pub local_to_remote: u64,
    /// Bytes copied from the tunnel to the local endpoint
    pub remote_to_local: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadSide {
    Open,
    Shut,
}

impl ReadSide {
    fn is_open(self) -> bool {
        self == ReadSide::Open
    }
}

/// Read one chunk from `from` and write all of it to `to`.
/// Returns the number of bytes moved; 0 means `from` reached end of stream.
fn pump<F, T>(from: &mut F, to: &mut T, buf: &mut [u8]) -> Result<usize>
where
    F: Conn + ?Sized,
    T: Conn + ?Sized,
{
    let n = loop {
        match from.read(buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };
    if n > 0 {
        to.write_all(&buf[..n])?;
        to.flush()?;
    }
    Ok(n)
}

/// Relay bytes between `local` and `remote` until both directions close.
///
/// End of stream from `local` half-closes the write side of `remote`; end of
/// stream from `remote` only stops reading it (its read side is shut, the
/// local write side is left alone). Any read or write error ends the relay.
pub fn relay<L, R>(local: &mut L, remote: &mut R, chunk_size: usize) -> Result<RelayStats>
where
    L: Conn + ?Sized,
    R: Conn + ?Sized,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut stats = RelayStats::default();
    let mut local_side = ReadSide::Open;
    let mut remote_side = ReadSide::Open;

    while local_side.is_open() || remote_side.is_open() {
        let (remote_ready, local_ready) = poll_pair(
            remote_side.is_open().then(|| remote.as_fd()),
            local_side.is_open().then(|| local.as_fd()),
        )?;

        if remote_ready {
            match pump(remote, local, &mut buf)? {
                0 => {
                    debug!("tunnel reached end of stream");
                    remote_side = ReadSide::Shut;
                    if let Err(e) = remote.shutdown(Shutdown::Read) {
                        debug!(error = %e, "tunnel read shutdown failed");
                    }
                }
                n => stats.remote_to_local += n as u64,
            }
        }

        if local_ready {
            match pump(local, remote, &mut buf)? {
                0 => {
                    debug!("client reached end of stream");
                    local_side = ReadSide::Shut;
                    if let Err(e) = remote.shutdown(Shutdown::Write) {
                        debug!(error = %e, "tunnel write shutdown failed");
                    }
                }
                n => stats.local_to_remote += n as u64,
            }
        }
    }

    debug!(
        sent = stats.local_to_remote,
        received = stats.remote_to_local,
        "relay finished"
    );
    Ok(stats)
}
