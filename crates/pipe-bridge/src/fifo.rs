//! FIFO creation and the open protocol for both pipe ends.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::stdio::set_nonblocking;

/// Whether [`ensure_fifo`] had to create the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoStatus {
    Created,
    Existing,
}

/// How [`open_writer`] obtained its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterOpen {
    /// A reader was already attached; the non-blocking open succeeded.
    Connected,
    /// No reader was attached; the handle came from the blocking fallback.
    WaitedForReader,
}

/// rw for everyone, before umask.
fn fifo_mode() -> Mode {
    Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP | Mode::S_IROTH | Mode::S_IWOTH
}

/// Create a FIFO at `path` unless something already exists there.
///
/// `EEXIST` is not checked further: an existing regular file at `path` is
/// accepted and later opened as-is.
pub fn ensure_fifo(path: &Path) -> Result<FifoStatus> {
    match mkfifo(path, fifo_mode()) {
        Ok(()) => {
            debug!(path = %path.display(), "Created FIFO");
            Ok(FifoStatus::Created)
        }
        Err(Errno::EEXIST) => Ok(FifoStatus::Existing),
        Err(errno) => Err(BridgeError::CreateFifo {
            path: path.to_path_buf(),
            source: errno.into(),
        }),
    }
}

/// Open the write end of a FIFO in two phases.
///
/// A non-blocking open fails with `ENXIO` while no reader is attached. In that
/// case this logs that it is waiting and falls back to a blocking open, which
/// returns once a reader shows up. Either way the returned handle is in
/// non-blocking mode, so a full pipe surfaces as `EAGAIN` on write.
pub fn open_writer(path: &Path) -> Result<(File, WriterOpen)> {
    let open_err = |source| BridgeError::OpenWriter {
        path: path.to_path_buf(),
        source,
    };

    match open_for_write(path, true) {
        Ok(file) => return Ok((file, WriterOpen::Connected)),
        Err(err) if err.raw_os_error() == Some(Errno::ENXIO as i32) => {}
        Err(err) => return Err(open_err(err)),
    }

    warn!(path = %path.display(), "Waiting for reader on {}...", path.display());
    let file = open_for_write(path, false).map_err(open_err)?;
    set_nonblocking(&file).map_err(open_err)?;
    debug!(path = %path.display(), "Reader attached");
    Ok((file, WriterOpen::WaitedForReader))
}

/// Open the read end of a FIFO without waiting for a writer.
pub fn open_reader(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
        .map_err(|source| BridgeError::OpenReader {
            path: path.to_path_buf(),
            source,
        })
}

fn open_for_write(path: &Path, nonblocking: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    if nonblocking {
        options.custom_flags(OFlag::O_NONBLOCK.bits());
    }
    options.open(path)
}
