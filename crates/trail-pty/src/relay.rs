//! The two copy loops. Each direction runs on its own thread and neither
//! waits on the other or on the recorder.

use std::io::{self, Write};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::debug;

use trail_core::record::{now_timestamp, Direction};

use crate::recorder::RecordMsg;
use crate::terminal::{poll_readable, read_fd, write_all_fd};

const POLL_MS: i32 = 50;
const CHUNK: usize = 8192;
/// VEOF in canonical mode: ends the child's read when piped input runs out.
const EOF_BYTE: u8 = 0x04;

#[derive(Debug, Default)]
pub(crate) struct RelayStats {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl RelayStats {
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

fn retryable(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}

/// User to child. Stops at end of input or once `stop` is raised.
pub(crate) fn spawn_input(
    input_fd: RawFd,
    master_fd: RawFd,
    interactive: bool,
    stop: Arc<AtomicBool>,
    tx: Sender<RecordMsg>,
    stats: Arc<RelayStats>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; CHUNK];
        while !stop.load(Ordering::Acquire) {
            match poll_readable(input_fd, POLL_MS) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!(error = %e, "input poll failed");
                    break;
                }
            }
            let n = match read_fd(input_fd, &mut buf) {
                Ok(0) => {
                    if !interactive {
                        let _ = write_all_fd(master_fd, &[EOF_BYTE]);
                    }
                    break;
                }
                Ok(n) => n,
                Err(e) if retryable(&e) => continue,
                Err(e) => {
                    debug!(error = %e, "input read failed");
                    break;
                }
            };
            let chunk = &buf[..n];
            if let Err(e) = write_all_fd(master_fd, chunk) {
                debug!(error = %e, "write to pty failed");
                break;
            }
            stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
            let _ = tx.send(RecordMsg::Chunk {
                dir: Direction::In,
                bytes: chunk.to_vec(),
                ts: now_timestamp(),
            });
        }
    })
}

/// Child to user. Runs until the pty reports EOF/EIO, or until `stop` is
/// raised and the master has gone quiet.
pub(crate) fn spawn_output(
    master_fd: RawFd,
    mut output: Box<dyn Write + Send>,
    stop: Arc<AtomicBool>,
    tx: Sender<RecordMsg>,
    stats: Arc<RelayStats>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; CHUNK];
        let mut output_ok = true;
        loop {
            match poll_readable(master_fd, POLL_MS) {
                Ok(true) => {}
                Ok(false) if stop.load(Ordering::Acquire) => break,
                Ok(false) => continue,
                Err(e) => {
                    debug!(error = %e, "pty poll failed");
                    break;
                }
            }
            let n = match read_fd(master_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if retryable(&e) => continue,
                // EIO once the last slave descriptor closes.
                Err(_) => break,
            };
            let chunk = &buf[..n];
            if output_ok {
                if let Err(e) = output.write_all(chunk).and_then(|()| output.flush()) {
                    // The session keeps running and keeps being recorded.
                    debug!(error = %e, "terminal output failed");
                    output_ok = false;
                }
            }
            stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
            let _ = tx.send(RecordMsg::Chunk {
                dir: Direction::Out,
                bytes: chunk.to_vec(),
                ts: now_timestamp(),
            });
        }
        let _ = output.flush();
    })
}
