#![cfg(unix)]

use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use trail_core::config::InterceptorConfig;
use trail_core::record::ControlEvent;
use trail_core::{Direction, SessionId};
use trail_pty::{ExitOutcome, InterceptOptions, Interceptor, SessionOutcome, TerminalIo};
use trail_store::{read_log, verify_file, SessionMetadata};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn options(root: &Path, script: &str) -> InterceptOptions {
    InterceptOptions {
        command: vec!["/bin/sh".into(), "-c".into(), script.into()],
        root: root.to_path_buf(),
        resume_from: None,
        config: InterceptorConfig {
            forward_signals: false,
            query_version: false,
            ..InterceptorConfig::default()
        },
        ship_after: None,
    }
}

/// Run with an input pipe that stays open (and empty) for the whole session.
fn run_quiet(options: InterceptOptions) -> (SessionOutcome, Vec<u8>) {
    let (read_end, _write_end) = pipe();
    let captured = Captured::default();
    let term = TerminalIo {
        input_fd: read_end.as_raw_fd(),
        output: Box::new(captured.clone()),
        interactive: false,
    };
    let outcome = Interceptor::new(options).run(term).unwrap();
    (outcome, captured.bytes())
}

fn out_bytes(outcome: &SessionOutcome) -> Vec<u8> {
    read_log(&outcome.paths.events)
        .unwrap()
        .records
        .iter()
        .filter(|r| r.dir == Direction::Out)
        .flat_map(|r| r.payload_bytes().unwrap())
        .collect()
}

#[test]
fn exit_zero_and_one_propagate() {
    let dir = tempfile::tempdir().unwrap();
    let (ok, _) = run_quiet(options(dir.path(), "exit 0"));
    assert_eq!(ok.exit, ExitOutcome::Code(0));
    let (fail, _) = run_quiet(options(dir.path(), "exit 1"));
    assert_eq!(fail.exit, ExitOutcome::Code(1));
    assert_eq!(fail.exit.exit_code(), 1);

    let meta = SessionMetadata::read(&fail.paths.meta).unwrap().unwrap();
    assert_eq!(meta.exit_code, Some(1));
    assert_eq!(meta.signal, None);
}

#[test]
fn signal_death_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let (outcome, _) = run_quiet(options(dir.path(), "kill -TERM $$"));
    assert_eq!(outcome.exit, ExitOutcome::Signaled(libc::SIGTERM));
    assert_eq!(outcome.exit.exit_code(), 128 + libc::SIGTERM);

    let records = read_log(&outcome.paths.events).unwrap().records;
    match records.last().unwrap().control_event() {
        Some(ControlEvent::SessionEnded(end)) => {
            assert_eq!(end.exit_code, None);
            assert_eq!(end.signal, Some(libc::SIGTERM));
        }
        other => panic!("unexpected last record: {other:?}"),
    }
}

#[test]
fn output_passes_through_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let (outcome, seen) = run_quiet(options(dir.path(), r"printf 'abc\033[0mdef'"));
    assert_eq!(seen, b"abc\x1b[0mdef");
    assert_eq!(out_bytes(&outcome), seen);
    assert_eq!(std::fs::read(&outcome.paths.raw).unwrap(), seen);
    assert_eq!(outcome.bytes_out, seen.len() as u64);
    assert_eq!(outcome.counters.raw_bytes, seen.len() as u64);
}

#[test]
fn log_is_chained_and_bracketed_by_control_records() {
    let dir = tempfile::tempdir().unwrap();
    let (outcome, _) = run_quiet(options(dir.path(), "printf hello"));
    assert!(outcome.logged);
    assert!(outcome.warning.is_none());

    let verification = verify_file(&outcome.paths.events, outcome.final_hash.as_deref()).unwrap();
    assert!(verification.report.is_intact());
    assert!(!verification.truncated_tail);

    let records = read_log(&outcome.paths.events).unwrap().records;
    match records.first().unwrap().control_event() {
        Some(ControlEvent::SessionStarted(start)) => {
            assert_eq!(start.cmd[0], "/bin/sh");
            assert!(start.pid > 0);
        }
        other => panic!("unexpected first record: {other:?}"),
    }
    assert!(records.iter().all(|r| r.session_id == outcome.session_id));

    let meta = SessionMetadata::read(&outcome.paths.meta).unwrap().unwrap();
    assert_eq!(meta.final_hash, outcome.final_hash);
    assert_eq!(meta.counters.records, records.len() as u64);
}

#[test]
fn piped_input_reaches_the_child_and_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let (read_end, write_end) = pipe();
    {
        let mut writer = std::fs::File::from(write_end);
        writer.write_all(b"hello\n").unwrap();
    }
    let captured = Captured::default();
    let term = TerminalIo {
        input_fd: read_end.as_raw_fd(),
        output: Box::new(captured.clone()),
        interactive: false,
    };
    let outcome = Interceptor::new(options(dir.path(), "cat")).run(term).unwrap();
    assert_eq!(outcome.exit, ExitOutcome::Code(0));

    let seen = captured.bytes();
    let text = String::from_utf8_lossy(&seen);
    // Once from the terminal's echo, once from cat.
    assert!(text.matches("hello").count() >= 2, "{text:?}");

    let input: Vec<u8> = read_log(&outcome.paths.events)
        .unwrap()
        .records
        .iter()
        .filter(|r| r.dir == Direction::In)
        .flat_map(|r| r.payload_bytes().unwrap())
        .collect();
    assert_eq!(input, b"hello\n");
    assert_eq!(outcome.bytes_in, 6);
}

#[test]
fn resumed_session_gets_new_id_and_link() {
    let dir = tempfile::tempdir().unwrap();
    let previous = SessionId::new();
    let mut opts = options(dir.path(), "exit 0");
    opts.resume_from = Some(previous.clone());
    let (outcome, _) = run_quiet(opts);

    assert_ne!(outcome.session_id, previous);
    let meta = SessionMetadata::read(&outcome.paths.meta).unwrap().unwrap();
    assert_eq!(meta.resumed_from, Some(previous));
}

#[test]
fn unwritable_root_still_runs_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"").unwrap();

    let (outcome, seen) = run_quiet(options(&blocker, "printf still-here; exit 3"));
    assert_eq!(outcome.exit, ExitOutcome::Code(3));
    assert_eq!(seen, b"still-here");
    assert!(!outcome.logged);
    assert!(outcome.final_hash.is_none());
}

#[test]
fn missing_program_is_a_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path(), "");
    opts.command = vec!["/definitely/not/a/program".into()];
    let (read_end, _write_end) = pipe();
    let term = TerminalIo {
        input_fd: read_end.as_raw_fd(),
        output: Box::new(io::sink()),
        interactive: false,
    };
    let err = Interceptor::new(opts).run(term).unwrap_err();
    assert_eq!(err.exit_code(), 127);
}

#[test]
fn program_version_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let tool = dir.path().join("tool");
    std::fs::write(&tool, "#!/bin/sh\nif [ \"$1\" = --version ]; then echo 'tool 1.2.3'; fi\nexit 0\n").unwrap();
    std::fs::set_permissions(&tool, std::os::unix::fs::PermissionsExt::from_mode(0o755)).unwrap();

    let mut opts = options(dir.path(), "");
    opts.command = vec![tool.display().to_string()];
    opts.config.query_version = true;
    let (outcome, _) = run_quiet(opts);

    let records = read_log(&outcome.paths.events).unwrap().records;
    match records.first().unwrap().control_event() {
        Some(ControlEvent::SessionStarted(start)) => {
            assert_eq!(start.program_version.as_deref(), Some("tool 1.2.3"));
        }
        other => panic!("unexpected first record: {other:?}"),
    }
}

#[test]
fn finished_log_is_handed_to_the_shipper() {
    let dir = tempfile::tempdir().unwrap();
    let copy = dir.path().join("handed-off.jsonl");
    let mut opts = options(dir.path(), "printf shipped");
    opts.ship_after = Some(vec![
        "/bin/sh".into(),
        "-c".into(),
        format!("cp \"$1\" '{}'", copy.display()),
        "sh".into(),
    ]);
    let (outcome, _) = run_quiet(opts);
    assert!(outcome.shipper.is_some());

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !copy.exists() && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert_eq!(
        std::fs::read(&copy).unwrap(),
        std::fs::read(&outcome.paths.events).unwrap()
    );
}

#[test]
fn no_shipper_without_a_log() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"").unwrap();
    let mut opts = options(&blocker, "exit 0");
    opts.ship_after = Some(vec!["/bin/true".into()]);
    let (outcome, _) = run_quiet(opts);
    assert!(!outcome.logged);
    assert!(outcome.shipper.is_none());
}
