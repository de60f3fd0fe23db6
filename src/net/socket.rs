use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use super::Readiness;
use crate::common::debug;

/// An either `TcpStream` or `UnixStream`, which implement
/// `AsyncRead` and `AsyncWrite` transparently.
pub struct Socket {
    kind: Kind,
}

enum Kind {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl Socket {
    pub async fn connect_tcp(host: &str, port: u16, keepalive: bool) -> io::Result<Socket> {
        use tokio::net::TcpSocket;

        let mut last_err = None;
        for addr in tokio::net::lookup_host((host, port)).await? {
            let socket = match addr.is_ipv4() {
                true => TcpSocket::new_v4()?,
                false => TcpSocket::new_v6()?,
            };
            socket.set_keepalive(keepalive)?;
            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("Connected via TCP Stream: {:?}", stream.local_addr());
                    return Ok(Socket { kind: Kind::Tcp(stream) });
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "host did not resolve to any address")
        }))
    }

    pub async fn connect_socket(path: &str) -> io::Result<Socket> {
        #[cfg(unix)]
        {
            let socket = tokio::net::UnixStream::connect(path).await?;
            debug!("Connected via Unix socket: {:?}", socket.peer_addr()?.as_pathname());
            Ok(Socket { kind: Kind::Unix(socket) })
        }

        #[cfg(not(unix))]
        {
            let _ = path;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            ))
        }
    }

    /// Read whatever is available into `buf` without waiting.
    ///
    /// Returns `Err(WouldBlock)` when nothing is buffered by the kernel.
    pub fn try_read_buf<B: bytes::BufMut>(&self, buf: &mut B) -> io::Result<usize> {
        match &self.kind {
            Kind::Tcp(tcp) => tcp.try_read_buf(buf),
            #[cfg(unix)]
            Kind::Unix(unix) => unix.try_read_buf(buf),
        }
    }

    /// Write as much of `buf` as the kernel accepts without waiting.
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match &self.kind {
            Kind::Tcp(tcp) => tcp.try_write(buf),
            #[cfg(unix)]
            Kind::Unix(unix) => unix.try_write(buf),
        }
    }

    /// Poll the socket for the readiness conditions in `mask`.
    ///
    /// Ready with the observed subset as soon as any condition holds.
    pub fn poll_readiness(&self, cx: &mut Context, mask: Readiness) -> Poll<io::Result<Readiness>> {
        let mut observed = Readiness::NONE;

        if mask.is_readable() {
            let poll = match &self.kind {
                Kind::Tcp(tcp) => tcp.poll_read_ready(cx),
                #[cfg(unix)]
                Kind::Unix(unix) => unix.poll_read_ready(cx),
            };
            if let Poll::Ready(result) = poll {
                result?;
                observed |= Readiness::READABLE;
            }
        }

        if mask.is_writable() {
            let poll = match &self.kind {
                Kind::Tcp(tcp) => tcp.poll_write_ready(cx),
                #[cfg(unix)]
                Kind::Unix(unix) => unix.poll_write_ready(cx),
            };
            if let Poll::Ready(result) = poll {
                result?;
                observed |= Readiness::WRITABLE;
            }
        }

        match observed.is_empty() {
            true => Poll::Pending,
            false => Poll::Ready(Ok(observed)),
        }
    }

    pub fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> {
        tokio::io::AsyncWriteExt::shutdown(self)
    }
}

impl tokio::io::AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_read(cx, buf),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_write(cx, buf),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_write_vectored(cx, bufs),
        }
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        true
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_shutdown(cx),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Tcp(tcp) => std::fmt::Debug::fmt(tcp, f),
            #[cfg(unix)]
            Kind::Unix(unix) => std::fmt::Debug::fmt(unix, f),
        }
    }
}
