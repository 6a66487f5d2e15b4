use std::io;
use std::os::fd::RawFd;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use signal_hook::iterator::{Handle, Signals};
use tracing::{debug, info};

use trail_core::record::{now_timestamp, ControlEvent};

use crate::recorder::RecordMsg;
use crate::terminal::{read_winsize, write_winsize};

const FORWARDED: [i32; 4] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP, libc::SIGQUIT];

/// Background thread that copies window-size changes onto the pty and
/// relays termination signals to the child's process group.
pub(crate) struct SignalForwarder {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalForwarder {
    /// `None` when there is nothing to listen for.
    pub fn install(
        child_pid: u32,
        master_fd: RawFd,
        size_fd: Option<RawFd>,
        forward: bool,
        tx: Sender<RecordMsg>,
    ) -> io::Result<Option<Self>> {
        let mut wanted = Vec::new();
        if size_fd.is_some() {
            wanted.push(libc::SIGWINCH);
        }
        if forward {
            wanted.extend(FORWARDED);
        }
        if wanted.is_empty() {
            return Ok(None);
        }

        let mut signals = Signals::new(&wanted)?;
        let handle = signals.handle();
        let pgid = child_pid as libc::pid_t;
        let thread = thread::spawn(move || {
            for signal in signals.forever() {
                if signal == libc::SIGWINCH {
                    let Some(size) = size_fd.and_then(read_winsize) else {
                        continue;
                    };
                    if let Err(e) = write_winsize(master_fd, size) {
                        debug!(error = %e, "resize propagation failed");
                        continue;
                    }
                    let (cols, rows) = size;
                    let _ = tx.send(RecordMsg::Control {
                        event: ControlEvent::Resized { cols, rows },
                        ts: now_timestamp(),
                    });
                    continue;
                }
                // The child is a session leader, so its pid is its group id.
                unsafe {
                    libc::kill(-pgid, signal);
                }
                info!(signal, "forwarded signal to child");
                let _ = tx.send(RecordMsg::Control {
                    event: ControlEvent::SignalForwarded { signal },
                    ts: now_timestamp(),
                });
            }
        });
        Ok(Some(Self {
            handle,
            thread: Some(thread),
        }))
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}
