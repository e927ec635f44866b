//! WAL streaming supervision.
//!
//! The transport is behind [`WalStreamer`]; the pipeline only cares that the
//! destination WAL directory ends up holding complete segments covering
//! `[start_lsn, stop_lsn]`, and that check is performed here, on disk,
//! independent of how the segments arrived.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::pg::lsn::Lsn;
use crate::pg::wal;
use crate::session::ConnectionOptions;
use crate::{Error, Result};

/// How often the wait loop re-checks the WAL directory.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A running WAL stream into a destination directory.
pub trait WalStreamHandle: Send {
    /// Block until complete segments cover `[start, stop]`, where `start` and
    /// the timeline were fixed when the stream was started.
    fn wait_until(&mut self, stop: Lsn, timeout: Duration) -> Result<()>;
    /// Stop the stream and release its resources.
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait WalStreamer {
    fn start(
        &self,
        wal_dir: &Path,
        start: Lsn,
        tli: u32,
        wal_seg_size: u32,
    ) -> Result<Box<dyn WalStreamHandle>>;
}

/// Streams WAL by running `pg_receivewal` against the source instance.
pub struct ReceiveWalStreamer {
    receivewal: PathBuf,
    connection: ConnectionOptions,
}

impl ReceiveWalStreamer {
    pub fn new(receivewal: PathBuf, connection: ConnectionOptions) -> ReceiveWalStreamer {
        ReceiveWalStreamer {
            receivewal,
            connection,
        }
    }
}

impl WalStreamer for ReceiveWalStreamer {
    fn start(
        &self,
        wal_dir: &Path,
        start: Lsn,
        tli: u32,
        wal_seg_size: u32,
    ) -> Result<Box<dyn WalStreamHandle>> {
        let mut command = Command::new(&self.receivewal);
        command
            .arg("-D")
            .arg(wal_dir)
            .arg("--no-password")
            .arg("--synchronous")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(host) = &self.connection.host {
            command.arg("-h").arg(host);
        }
        if let Some(port) = self.connection.port {
            command.arg("-p").arg(port.to_string());
        }
        if let Some(user) = &self.connection.user {
            command.arg("-U").arg(user);
        }

        let child = command
            .spawn()
            .map_err(|err| Error::Streaming(format!("cannot spawn pg_receivewal: {err}")))?;
        info!(start_lsn = %start, tli, "wal streaming started");

        Ok(Box::new(ReceiveWalHandle {
            child,
            wal_dir: wal_dir.to_path_buf(),
            start,
            tli,
            wal_seg_size,
        }))
    }
}

struct ReceiveWalHandle {
    child: Child,
    wal_dir: PathBuf,
    start: Lsn,
    tli: u32,
    wal_seg_size: u32,
}

impl Drop for ReceiveWalHandle {
    fn drop(&mut self) {
        // No stream may outlive a failed run.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl WalStreamHandle for ReceiveWalHandle {
    fn wait_until(&mut self, stop: Lsn, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if crate::interrupted() {
                return Err(Error::Interrupted.into());
            }
            if let Some(status) = self
                .child
                .try_wait()
                .map_err(|err| Error::Streaming(err.to_string()))?
            {
                return Err(Error::Streaming(format!(
                    "wal receiver exited early with {status}"
                ))
                .into());
            }
            if wal::segments_complete(
                &self.wal_dir,
                self.tli,
                self.start,
                stop,
                self.wal_seg_size as u64,
            )? {
                debug!(stop_lsn = %stop, "wal segments present through stop lsn");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Streaming(format!(
                    "timed out waiting for wal segments through {stop}"
                ))
                .into());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        // SIGINT lets pg_receivewal flush and close the current segment.
        let pid = self.child.id() as i32;
        unsafe {
            libc::kill(pid, libc::SIGINT);
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return Ok(()),
                Ok(None) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
                Ok(None) => {
                    warn!("wal receiver did not stop in time, killing it");
                    self.child
                        .kill()
                        .map_err(|err| Error::Streaming(err.to_string()))?;
                    self.child
                        .wait()
                        .map_err(|err| Error::Streaming(err.to_string()))?;
                    return Ok(());
                }
                Err(err) => return Err(Error::Streaming(err.to_string()).into()),
            }
        }
    }
}
