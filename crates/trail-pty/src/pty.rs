use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use libc::c_int;

/// Master/slave halves of a freshly allocated pseudo-terminal.
/// Both ends are close-on-exec; the child gets the slave through dup2.
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

impl PtyPair {
    /// Allocate a PTY, optionally with an initial `(cols, rows)` size.
    pub fn open(size: Option<(u16, u16)>) -> io::Result<Self> {
        let mut master: c_int = -1;
        let mut slave: c_int = -1;
        let mut winsize = size.map(|(cols, rows)| libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        });
        let winp = winsize
            .as_mut()
            .map_or(std::ptr::null_mut(), |w| w as *mut libc::winsize);
        let result = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                winp,
            )
        };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        // Owned immediately so an error below still closes both.
        let pair = unsafe {
            Self {
                master: OwnedFd::from_raw_fd(master),
                slave: OwnedFd::from_raw_fd(slave),
            }
        };
        set_cloexec(pair.master.as_raw_fd())?;
        set_cloexec(pair.slave.as_raw_fd())?;
        Ok(pair)
    }

    /// Spawn `argv[0] argv[1..]` as a session leader whose controlling
    /// terminal is the slave. Consumes the pair's slave end: once the
    /// child holds it, the parent must not, or EOF never reaches the master.
    pub fn spawn<S: AsRef<OsStr>>(self, argv: &[S]) -> io::Result<(OwnedFd, Child)> {
        let Some((program, args)) = argv.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty argv"));
        };
        let Self { master, slave } = self;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd.spawn()?;
        // `cmd` (and with it the parent's slave copies) drops here.
        drop(cmd);
        Ok((master, child))
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
