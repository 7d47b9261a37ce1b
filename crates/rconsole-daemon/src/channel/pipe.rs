//! Anonymous pipes for child stdio redirection.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

/// Both ends of a freshly created pipe. Each end is close-on-exec; the end
/// handed to the child is dup'ed onto its stdio slot by `Command`, which
/// clears the flag on the duplicate only.
#[derive(Debug)]
pub struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

pub fn create_pipe() -> io::Result<Pipe> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    raw_pipe(&mut fds)?;
    // SAFETY: the pipe call succeeded, so both descriptors are open and
    // nothing else owns them yet.
    #[allow(unsafe_code)]
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        use std::os::fd::AsFd;
        set_cloexec(read.as_fd())?;
        set_cloexec(write.as_fd())?;
    }
    Ok(Pipe { read, write })
}

/// Flags are set atomically with creation, so a concurrent spawn on another
/// thread can never inherit these descriptors.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn raw_pipe(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
    // SAFETY: `fds` is a writable array of two c_ints, exactly what pipe2(2)
    // fills in.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn raw_pipe(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
    // SAFETY: `fds` is a writable array of two c_ints, exactly what pipe(2)
    // fills in.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: F_GETFD on a live descriptor only reads its flag word.
    #[allow(unsafe_code)]
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: F_SETFD on a live descriptor only updates its flag word.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Number of bytes buffered in the pipe, without consuming them.
pub fn bytes_available(fd: BorrowedFd<'_>) -> io::Result<usize> {
    let mut available: libc::c_int = 0;
    // SAFETY: FIONREAD stores one c_int through the pointer, which points at
    // a live local for the duration of the call.
    #[allow(unsafe_code)]
    let ret = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            libc::FIONREAD,
            std::ptr::from_mut(&mut available),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(usize::try_from(available).unwrap_or(0))
}

/// Put `fd` in non-blocking mode. Only the open file description behind
/// `fd` changes; the other end of the pipe keeps its own mode.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: F_GETFL on a live descriptor only reads its status flags.
    #[allow(unsafe_code)]
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: F_SETFL on a live descriptor only updates its status flags.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    #[test]
    fn peek_reports_buffered_bytes_without_consuming() {
        let pipe = create_pipe().unwrap();
        let mut writer = File::from(pipe.write);
        let mut reader = File::from(pipe.read);

        assert_eq!(bytes_available(reader.as_fd()).unwrap(), 0);
        writer.write_all(b"hello").unwrap();
        assert_eq!(bytes_available(reader.as_fd()).unwrap(), 5);
        assert_eq!(bytes_available(reader.as_fd()).unwrap(), 5);

        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hel");
        assert_eq!(bytes_available(reader.as_fd()).unwrap(), 2);
    }

    #[test]
    fn both_ends_are_close_on_exec() {
        let pipe = create_pipe().unwrap();
        for fd in [pipe.read.as_raw_fd(), pipe.write.as_raw_fd()] {
            // SAFETY: F_GETFD on a descriptor owned by `pipe` for this scope.
            #[allow(unsafe_code)]
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert!(flags & libc::FD_CLOEXEC != 0);
        }
    }

    #[test]
    fn full_nonblocking_write_end_reports_would_block() {
        let pipe = create_pipe().unwrap();
        set_nonblocking(pipe.write.as_fd()).unwrap();
        let mut writer = File::from(pipe.write);
        let mut reader = File::from(pipe.read);

        let chunk = [0u8; 4096];
        let err = loop {
            match writer.write(&chunk) {
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        // The read end keeps its own mode and drains normally.
        let mut buf = [0u8; 16];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }
}
