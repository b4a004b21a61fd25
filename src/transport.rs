//! A collection of traits abstracting over blocking byte streams.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

/// An abstraction over the streams a connection can use: plain TCP or a
/// TLS session supplied by the configured connector.
///
/// `try_clone` must return an independent handle over the same underlying
/// socket; HTTP/2 uses one handle on a dedicated reader thread while writers
/// share another behind a lock.
pub trait Transport: Read + Write + Send {
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;

    /// Shuts down both directions of the socket. Used by cancellation.
    fn shutdown(&self) -> io::Result<()>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(TcpStream::try_clone(self)?))
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.peer_addr() {
            Ok(addr) => write!(f, "Transport({})", addr),
            Err(_) => f.write_str("Transport"),
        }
    }
}

/// Applies the socket options every new connection gets.
pub(crate) fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(true)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    //! An in-memory duplex transport for codec tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Condvar, Mutex};

    #[derive(Default)]
    struct Pipe {
        buf: VecDeque<u8>,
        closed: bool,
    }

    #[derive(Default)]
    struct Shared {
        pipe: Mutex<Pipe>,
        ready: Condvar,
    }

    impl Shared {
        fn write(&self, data: &[u8]) -> io::Result<usize> {
            let mut pipe = self.pipe.lock().unwrap();
            if pipe.closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
            }
            pipe.buf.extend(data);
            self.ready.notify_all();
            Ok(data.len())
        }

        fn read(&self, out: &mut [u8]) -> io::Result<usize> {
            let mut pipe = self.pipe.lock().unwrap();
            while pipe.buf.is_empty() && !pipe.closed {
                pipe = self.ready.wait(pipe).unwrap();
            }
            let n = out.len().min(pipe.buf.len());
            for slot in out.iter_mut().take(n) {
                *slot = pipe.buf.pop_front().unwrap();
            }
            Ok(n)
        }

        fn close(&self) {
            self.pipe.lock().unwrap().closed = true;
            self.ready.notify_all();
        }
    }

    /// One end of an in-memory socket pair.
    pub(crate) struct MemoryTransport {
        incoming: Arc<Shared>,
        outgoing: Arc<Shared>,
    }

    /// Creates a connected transport pair.
    pub(crate) fn pair() -> (MemoryTransport, MemoryTransport) {
        let a = Arc::new(Shared::default());
        let b = Arc::new(Shared::default());
        (
            MemoryTransport {
                incoming: a.clone(),
                outgoing: b.clone(),
            },
            MemoryTransport {
                incoming: b,
                outgoing: a,
            },
        )
    }

    impl Read for MemoryTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.incoming.read(buf)
        }
    }

    impl Write for MemoryTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outgoing.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for MemoryTransport {
        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }

        fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
            Ok(Box::new(MemoryTransport {
                incoming: self.incoming.clone(),
                outgoing: self.outgoing.clone(),
            }))
        }

        fn shutdown(&self) -> io::Result<()> {
            self.incoming.close();
            self.outgoing.close();
            Ok(())
        }

        fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
    }
}
