//! Low-level Unix socket plumbing.
//!
//! `std::os::unix::net::UnixListener::bind` offers no control over the
//! listen backlog, so the IPC socket is created through raw `libc` calls
//! here and handed back as a standard listener.

use std::io;
use std::os::fd::FromRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixListener;
use std::path::Path;

/// Create a listening Unix stream socket at `path` with the given backlog.
///
/// The caller is responsible for unlinking any stale file first and for
/// removing the socket on shutdown.
///
/// # Safety
/// The fd is created, bound, and switched to listening before being wrapped;
/// on any failure it is closed and never escapes.
pub fn bind_unix_listener(path: &Path, backlog: i32) -> io::Result<UnixListener> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // sun_path must hold the path plus a terminating NUL.
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("socket path too long: {}", path.display()),
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: addr is fully initialized above; every syscall's return value
    // is checked and the fd is closed on the error paths.
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let addr_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        if libc::bind(fd, &addr as *const libc::sockaddr_un as *const libc::sockaddr, addr_len) != 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, backlog) != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(UnixListener::from_raw_fd(fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use tempfile::TempDir;

    #[test]
    fn bind_creates_socket_file_and_accepts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plumbing.sock");

        let listener = bind_unix_listener(&path, 10).unwrap();
        assert!(path.exists());

        let mut client = UnixStream::connect(&path).unwrap();
        let (mut accepted, _) = listener.accept().unwrap();

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn bind_rejects_overlong_path() {
        let long = "x".repeat(200);
        let err = bind_unix_listener(Path::new(&format!("/tmp/{}", long)), 10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn bind_fails_on_existing_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taken.sock");
        let _first = bind_unix_listener(&path, 10).unwrap();
        assert!(bind_unix_listener(&path, 10).is_err());
    }
}
