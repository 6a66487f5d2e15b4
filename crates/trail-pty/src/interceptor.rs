//! Runs one wrapped session end to end.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use trail_core::argv;
use trail_core::config::InterceptorConfig;
use trail_core::record::{format_timestamp, now_timestamp, ControlEvent, SessionEnd, SessionStart};
use trail_core::SessionId;
use trail_store::{Counters, SessionMetadata, SessionPaths, METADATA_VERSION};

use crate::error::InterceptError;
use crate::exit::ExitOutcome;
use crate::pty::PtyPair;
use crate::recorder::{Finished, Recorder};
use crate::relay::{self, RelayStats};
use crate::signals::SignalForwarder;
use crate::terminal::{is_tty, read_winsize, RawModeGuard};

/// The user's side of the session.
pub struct TerminalIo {
    pub input_fd: RawFd,
    pub output: Box<dyn Write + Send>,
    /// Input is a terminal: raw mode, size tracking.
    pub interactive: bool,
}

impl TerminalIo {
    pub fn stdio() -> Self {
        let input_fd = io::stdin().as_raw_fd();
        Self {
            input_fd,
            output: Box::new(io::stdout()),
            interactive: is_tty(input_fd),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InterceptOptions {
    /// Program and its arguments.
    pub command: Vec<String>,
    pub root: PathBuf,
    pub resume_from: Option<SessionId>,
    pub config: InterceptorConfig,
    /// Command prefix run detached with the events path appended once the
    /// session is finalized.
    pub ship_after: Option<Vec<String>>,
}

#[derive(Clone, Debug)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub paths: SessionPaths,
    pub exit: ExitOutcome,
    pub final_hash: Option<String>,
    pub counters: Counters,
    /// Bytes relayed, whether or not they could be recorded.
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub logged: bool,
    pub warning: Option<String>,
    /// Pid of the detached shipper started for this log.
    pub shipper: Option<u32>,
}

pub struct Interceptor {
    options: InterceptOptions,
}

impl Interceptor {
    pub fn new(options: InterceptOptions) -> Self {
        Self { options }
    }

    /// Spawn the command on a fresh pty, relay until it exits, finalize.
    ///
    /// Only failures to start the child are errors. Logging problems are
    /// reported through [`SessionOutcome::warning`] and never stop the session.
    #[instrument(skip_all, fields(root = %self.options.root.display()))]
    pub fn run(self, term: TerminalIo) -> Result<SessionOutcome, InterceptError> {
        let InterceptOptions {
            command,
            root,
            resume_from,
            config,
            ship_after,
        } = self.options;
        let program = command.first().cloned().ok_or(InterceptError::EmptyCommand)?;
        let program_version = if config.query_version {
            query_version(&program, Duration::from_millis(config.version_timeout_ms))
        } else {
            None
        };

        let session_id = SessionId::new();
        let started = Utc::now();
        let started_at = format_timestamp(started);
        let size = if term.interactive { read_winsize(term.input_fd) } else { None };

        let pair = PtyPair::open(size).map_err(InterceptError::Pty)?;
        let (master, mut child) = pair
            .spawn(&command)
            .map_err(|source| InterceptError::Spawn { program, source })?;
        let master_fd = master.as_raw_fd();
        let pid = child.id();

        let paths = SessionPaths::new(&root, started.date_naive(), &session_id);
        let mut recorder = Recorder::open(session_id.clone(), paths.clone(), config.transient_retry_limit);
        if let Some(warning) = recorder.take_warning() {
            eprintln!("{warning}");
        }

        let start = SessionStart {
            cmd: command.clone(),
            cwd: current_dir(),
            host: hostname(),
            user: username(),
            pid,
            model: argv::detect_model(&command),
            resumed_from: resume_from,
            wrapped_session_uuid: argv::detect_resume_uuid(&command),
            program_version,
            env: whitelisted_env(&config.env_whitelist),
        };
        recorder.record_control(&ControlEvent::SessionStarted(start.clone()), started_at.clone());
        if let Some((cols, rows)) = size {
            recorder.record_control(&ControlEvent::Resized { cols, rows }, now_timestamp());
        }
        info!(session_id = %session_id, pid, logging = recorder.is_logging(), "session started");

        let raw_guard = if term.interactive {
            match RawModeGuard::enable(term.input_fd) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    warn!(error = %e, "could not enter raw mode");
                    None
                }
            }
        } else {
            None
        };

        let (tx, recorder_thread) = recorder.spawn();
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(RelayStats::default());

        let size_fd = term.interactive.then_some(term.input_fd);
        let forwarder = match SignalForwarder::install(pid, master_fd, size_fd, config.forward_signals, tx.clone()) {
            Ok(forwarder) => forwarder,
            Err(e) => {
                warn!(error = %e, "signal forwarding unavailable");
                None
            }
        };
        let output = relay::spawn_output(master_fd, term.output, stop.clone(), tx.clone(), stats.clone());
        let input = relay::spawn_input(
            term.input_fd,
            master_fd,
            term.interactive,
            stop.clone(),
            tx,
            stats.clone(),
        );

        let waited = child.wait();

        // Drain what the child wrote before it exited, then release everything
        // that still holds a sender so the recorder thread can finish.
        stop.store(true, Ordering::Release);
        let _ = output.join();
        let _ = input.join();
        if let Some(forwarder) = forwarder {
            forwarder.shutdown();
        }
        let recorder = recorder_thread.join();
        drop(raw_guard);

        // The session is finalized even when the child's status is lost.
        let exit = waited.map(ExitOutcome::from_status);
        let finished = match recorder {
            Ok(recorder) => finalize(
                recorder,
                start,
                started_at,
                exit.as_ref().ok(),
                (stats.bytes_in(), stats.bytes_out()),
            ),
            Err(_) => Finished {
                final_hash: None,
                counters: Counters::default(),
                metadata_written: false,
                warning: Some("trail: session recorder failed; the log may be incomplete".to_string()),
            },
        };
        // Logs are closed before the pty is released.
        drop(master);

        if let Some(warning) = &finished.warning {
            eprintln!("{warning}");
        }
        let exit = exit.map_err(InterceptError::Wait)?;

        let shipper = match ship_after {
            Some(prefix) if finished.metadata_written => match hand_off(&prefix, &paths.events) {
                Ok(pid) => Some(pid),
                Err(e) => {
                    warn!(error = %e, "could not start shipper");
                    None
                }
            },
            _ => None,
        };
        info!(
            session_id = %session_id,
            exit_code = exit.exit_code(),
            records = finished.counters.records,
            "session finalized"
        );

        Ok(SessionOutcome {
            session_id,
            paths,
            exit,
            final_hash: finished.final_hash,
            counters: finished.counters,
            bytes_in: stats.bytes_in(),
            bytes_out: stats.bytes_out(),
            logged: finished.metadata_written,
            warning: finished.warning,
            shipper,
        })
    }
}

/// Append `session_ended` and write `meta.json`. A lost exit status is
/// recorded as unknown.
fn finalize(
    recorder: Recorder,
    start: SessionStart,
    started_at: String,
    exit: Option<&ExitOutcome>,
    (bytes_in, bytes_out): (u64, u64),
) -> Finished {
    let exit_code = exit.and_then(ExitOutcome::code);
    let signal = exit.and_then(ExitOutcome::signal);
    let ended_at = now_timestamp();
    let end = SessionEnd {
        exit_code,
        signal,
        bytes_in,
        bytes_out,
    };
    let metadata = SessionMetadata {
        session_id: recorder.session_id().clone(),
        started_at,
        ended_at: Some(ended_at.clone()),
        exit_code,
        signal,
        cmd: start.cmd,
        cwd: start.cwd,
        host: start.host,
        model: start.model,
        resumed_from: start.resumed_from,
        counters: Counters::default(),
        final_hash: None,
        version: METADATA_VERSION,
    };
    recorder.finish(end, ended_at, metadata)
}

/// First non-empty line `<program> --version` prints, if it succeeds
/// within `timeout`.
pub fn query_version(program: &str, timeout: Duration) -> Option<String> {
    let mut child = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                debug!(program, "version query gave up");
                return None;
            }
        }
    };
    if !status.success() {
        return None;
    }
    let mut out = String::new();
    child.stdout.take()?.read_to_string(&mut out).ok()?;
    out.lines().map(str::trim).find(|line| !line.is_empty()).map(str::to_owned)
}

/// Start `prefix... <events>` in its own process group, detached from the
/// terminal. The wrapper does not wait for it.
fn hand_off(prefix: &[String], events: &Path) -> io::Result<u32> {
    let (program, args) = prefix
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty ship command"))?;
    let child = Command::new(program)
        .args(args)
        .arg(events)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;
    info!(pid = child.id(), events = %events.display(), "shipper started");
    Ok(child.id())
}

fn current_dir() -> String {
    std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

/// This machine's name, or empty if it cannot be read.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let result = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if result != 0 {
        return String::new();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_default()
}

fn whitelisted_env(names: &[String]) -> BTreeMap<String, String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
        .collect()
}
