//! Standard stream preparation.
//!
//! The loop works on duplicates of fd 0 and fd 1. A duplicate shares the
//! open file description with the original, so switching it to non-blocking
//! mode switches the process's own stdin/stdout too. Dropping the duplicates
//! leaves fd 0 and fd 1 open for normal process teardown.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};

use nix::fcntl::{FcntlArg, OFlag, fcntl};

use crate::bridge::Endpoint;
use crate::error::{BridgeError, Result};

/// Set `O_NONBLOCK` on a descriptor, keeping its other status flags.
pub fn set_nonblocking<Fd: AsFd>(fd: Fd) -> io::Result<()> {
    let fd = fd.as_fd();
    let mut flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    if !flags.contains(OFlag::O_NONBLOCK) {
        flags.insert(OFlag::O_NONBLOCK);
        fcntl(fd, FcntlArg::F_SETFL(flags))?;
    }
    Ok(())
}

/// Whether `O_NONBLOCK` is set on a descriptor.
pub fn is_nonblocking<Fd: AsFd>(fd: Fd) -> io::Result<bool> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_fd(), FcntlArg::F_GETFL)?);
    Ok(flags.contains(OFlag::O_NONBLOCK))
}

/// Duplicate stdin and stdout and switch both to non-blocking mode.
///
/// The mode is not restored afterwards.
pub fn take_nonblocking() -> Result<(File, File)> {
    let stdin = prepare(io::stdin().as_fd(), Endpoint::Stdin)?;
    let stdout = prepare(io::stdout().as_fd(), Endpoint::Stdout)?;
    Ok((stdin, stdout))
}

fn prepare(fd: BorrowedFd<'_>, endpoint: Endpoint) -> Result<File> {
    let owned = fd
        .try_clone_to_owned()
        .map_err(|source| BridgeError::Stdio { endpoint, source })?;
    set_nonblocking(&owned).map_err(|source| BridgeError::Stdio { endpoint, source })?;
    Ok(File::from(owned))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn set_nonblocking_is_idempotent() {
        let (reader, _writer) = nix::unistd::pipe().unwrap();
        assert!(!is_nonblocking(&reader).unwrap());
        set_nonblocking(&reader).unwrap();
        set_nonblocking(&reader).unwrap();
        assert!(is_nonblocking(&reader).unwrap());
    }

    #[test]
    fn duplicate_shares_status_flags() {
        let (reader, _writer) = nix::unistd::pipe().unwrap();
        let dup = prepare(reader.as_fd(), Endpoint::Stdin).unwrap();
        assert!(is_nonblocking(&dup).unwrap());
        assert!(is_nonblocking(&reader).unwrap());
    }
}
