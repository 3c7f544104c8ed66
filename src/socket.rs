//! Socket plumbing shared by client and server.

use std::io;
use std::net::{Shutdown, TcpStream};

/// Take over the socket of a mio stream as a std stream.
pub(crate) fn into_std(stream: mio::net::TcpStream) -> TcpStream {
    #[cfg(unix)]
    {
        use std::os::unix::io::{FromRawFd, IntoRawFd};
        // SAFETY: fd diambil alih sepenuhnya dari mio stream
        unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) }
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{FromRawSocket, IntoRawSocket};
        // SAFETY: socket diambil alih sepenuhnya dari mio stream
        unsafe { TcpStream::from_raw_socket(stream.into_raw_socket()) }
    }
}

/// Wrap a std stream for registration with a `mio::Poll`.
pub(crate) fn into_mio(stream: TcpStream) -> io::Result<mio::net::TcpStream> {
    stream.set_nonblocking(true)?;
    Ok(mio::net::TcpStream::from_std(stream))
}

/// Shut a socket down both ways so every clone of it observes the close.
/// A peer that already went away is not an error.
pub(crate) fn shutdown_both(stream: &TcpStream) -> io::Result<()> {
    match stream.shutdown(Shutdown::Both) {
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

/// Set the kernel receive buffer (`SO_RCVBUF`).
#[cfg(unix)]
pub(crate) fn set_recv_buffer(stream: &TcpStream, bytes: usize) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let optval = libc::c_int::try_from(bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "receive buffer too large"))?;
    // SAFETY: fd valid selama `stream` hidup, optval berukuran c_int
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub(crate) fn set_recv_buffer(_stream: &TcpStream, _bytes: usize) -> io::Result<()> {
    Ok(())
}
