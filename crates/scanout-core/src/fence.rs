use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{FromRawFd, OwnedFd};

/// A CPU-signaled completion signal backed by a pipe.
///
/// The pollable end becomes readable on [`signal`](Self::signal) and reports
/// hang-up once the fence is dropped or [`abandon`](Self::abandon)ed. A fence
/// that was signaled before it was dropped still reads as signaled: the byte
/// stays queued in the pipe for the waiter to find.
#[derive(Debug)]
pub struct SoftwareFence {
    writer: File,
}

impl SoftwareFence {
    /// Returns the signaling side and the pollable side.
    pub fn new() -> io::Result<(SoftwareFence, OwnedFd)> {
        let mut fds = [0; 2];
        // SAFETY: `fds` has room for the two descriptors pipe2 writes.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, both descriptors are fresh and owned by us.
        let (reader, writer) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok((
            SoftwareFence {
                writer: File::from(writer),
            },
            reader,
        ))
    }

    /// Mark the work as complete.
    ///
    /// Signaling after the pollable end was closed (nobody is waiting any
    /// more, e.g. the commit was cancelled) succeeds and does nothing.
    pub fn signal(&self) -> io::Result<()> {
        match (&self.writer).write_all(&[1]) {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            result => result,
        }
    }

    /// Close without signaling; pollers observe a hang-up.
    pub fn abandon(self) {
        drop(self.writer);
    }
}
