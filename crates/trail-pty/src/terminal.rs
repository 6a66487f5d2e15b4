//! Thin termios / ioctl / poll helpers over raw file descriptors.

use std::io;
use std::os::fd::RawFd;

use libc::c_int;

pub fn is_tty(fd: RawFd) -> bool {
    unsafe { libc::isatty(fd) == 1 }
}

/// `(cols, rows)` of the terminal on `fd`, if it is one with a real size.
pub fn read_winsize(fd: RawFd) -> Option<(u16, u16)> {
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut size) };
    if result == 0 && size.ws_col > 0 && size.ws_row > 0 {
        Some((size.ws_col, size.ws_row))
    } else {
        None
    }
}

pub fn write_winsize(fd: RawFd, (cols, rows): (u16, u16)) -> io::Result<()> {
    let size = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &size) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wait up to `timeout_ms` for `fd` to become readable (or hung up).
pub fn poll_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut fds = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let result = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(result > 0 && (fds.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR)) != 0)
}

pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Write every byte, retrying on EINTR and waiting out EAGAIN.
pub fn write_all_fd(fd: RawFd, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    wait_writable(fd)?;
                    continue;
                }
                _ => return Err(err),
            }
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
        }
        bytes = &bytes[n as usize..];
    }
    Ok(())
}

fn wait_writable(fd: c_int) -> io::Result<()> {
    let mut fds = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        let result = unsafe { libc::poll(&mut fds, 1, -1) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if (fds.revents & libc::POLLOUT) != 0 {
            return Ok(());
        }
        if (fds.revents & (libc::POLLHUP | libc::POLLERR)) != 0 {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
    }
}

fn get_termios(fd: RawFd) -> io::Result<libc::termios> {
    let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
    let result = unsafe { libc::tcgetattr(fd, &mut termios) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(termios)
}

fn set_termios(fd: RawFd, termios: &libc::termios) -> io::Result<()> {
    let result = unsafe { libc::tcsetattr(fd, libc::TCSANOW, termios) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Puts a terminal in raw mode and restores the original settings on drop,
/// whatever path the caller leaves by.
pub struct RawModeGuard {
    fd: RawFd,
    original: libc::termios,
}

impl RawModeGuard {
    pub fn enable(fd: RawFd) -> io::Result<Self> {
        let original = get_termios(fd)?;
        let mut raw = original;
        unsafe {
            libc::cfmakeraw(&mut raw);
        }
        set_termios(fd, &raw)?;
        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = set_termios(self.fd, &self.original);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtyPair;
    use std::os::fd::AsRawFd;

    #[test]
    fn winsize_roundtrip_on_pty() {
        let pair = PtyPair::open(Some((100, 30))).unwrap();
        assert_eq!(read_winsize(pair.master.as_raw_fd()), Some((100, 30)));
        write_winsize(pair.master.as_raw_fd(), (132, 43)).unwrap();
        assert_eq!(read_winsize(pair.slave.as_raw_fd()), Some((132, 43)));
    }

    #[test]
    fn raw_mode_is_restored_on_drop() {
        let pair = PtyPair::open(None).unwrap();
        let fd = pair.slave.as_raw_fd();
        assert!(is_tty(fd));
        let before = get_termios(fd).unwrap();
        {
            let _guard = RawModeGuard::enable(fd).unwrap();
            let raw = get_termios(fd).unwrap();
            assert_eq!(raw.c_lflag & libc::ICANON, 0);
        }
        let after = get_termios(fd).unwrap();
        assert_eq!(before.c_lflag, after.c_lflag);
        assert_eq!(before.c_iflag, after.c_iflag);
    }

    #[test]
    fn pipes_are_not_ttys() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert!(!is_tty(fds[0]));
        assert!(RawModeGuard::enable(fds[0]).is_err());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn write_then_poll_then_read() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert!(!poll_readable(fds[0], 0).unwrap());
        write_all_fd(fds[1], b"ping").unwrap();
        assert!(poll_readable(fds[0], 100).unwrap());
        let mut buf = [0u8; 8];
        assert_eq!(read_fd(fds[0], &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
