use crate::transport::{Request, Transport, TransportOutcome};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// Upper bound on the single read performed after a payload is written.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Writes raw bytes to a TCP listener and performs one bounded read.
///
/// Each delivery opens its own connection; the stream is owned by `exchange`
/// and closed when it returns, whatever the outcome.
pub struct SocketTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl SocketTransport {
    pub fn new(host: &str, port: u16, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout,
            io_timeout,
        }
    }

    fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        Ok((self.host.as_str(), self.port).to_socket_addrs()?.collect())
    }

    fn connect(&self) -> Result<TcpStream, TransportOutcome> {
        let addrs = self.resolve().map_err(|e| {
            debug!(host = %self.host, error = %e, "Address resolution failed");
            TransportOutcome::ConnectionRefused
        })?;

        let mut last_outcome = TransportOutcome::ConnectionRefused;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "Connect failed");
                    last_outcome = match e.kind() {
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                            TransportOutcome::TimedOut
                        }
                        _ => TransportOutcome::ConnectionRefused,
                    };
                }
            }
        }
        Err(last_outcome)
    }

    fn exchange(&self, payload: &[u8]) -> TransportOutcome {
        let mut stream = match self.connect() {
            Ok(stream) => stream,
            Err(outcome) => return outcome,
        };

        if let Err(e) = stream
            .set_read_timeout(Some(self.io_timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.io_timeout)))
        {
            debug!(error = %e, "Failed to configure socket timeouts");
            return TransportOutcome::ConnectionReset;
        }

        if let Err(e) = stream.write_all(payload) {
            debug!(error = %e, "Write failed before payload completed");
            return match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportOutcome::TimedOut,
                _ => TransportOutcome::ConnectionReset,
            };
        }

        let mut buf = [0u8; READ_BUFFER_SIZE];
        let outcome = match stream.read(&mut buf) {
            Ok(0) => TransportOutcome::ConnectionReset,
            Ok(n) => TransportOutcome::PartialRead(buf[..n].to_vec()),
            Err(e) => match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportOutcome::TimedOut,
                _ => {
                    debug!(error = %e, "Read failed");
                    TransportOutcome::ConnectionReset
                }
            },
        };
        let _ = stream.shutdown(Shutdown::Both);
        outcome
    }
}

impl Transport for SocketTransport {
    fn deliver(&self, request: &Request) -> TransportOutcome {
        match request {
            Request::Raw(payload) => self.exchange(payload),
            Request::Http { .. } => TransportOutcome::Malformed(
                "HTTP requests must go through the HTTP transport".to_string(),
            ),
        }
    }
}
