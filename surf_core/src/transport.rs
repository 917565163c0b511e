use crate::http::HttpTransport;
use crate::input::escape_bytes;
use crate::socket::SocketTransport;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The closed set of methods the route fuzzer draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 5] = [
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Delete,
        HttpMethod::Patch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HttpMethod::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown HTTP method '{s}'"))
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a property asks the transport layer to send for one trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// An HTTP exchange against the configured base URL. `path` is appended
    /// verbatim; `query` pairs are percent-encoded by the client.
    Http {
        method: HttpMethod,
        path: String,
        query: Vec<(String, String)>,
    },
    /// Bytes written as-is to the target's TCP listener.
    Raw(Vec<u8>),
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Http {
                method,
                path,
                query,
            } => {
                write!(f, "{method} {path}")?;
                for (i, (key, value)) in query.iter().enumerate() {
                    let sep = if i == 0 { '?' } else { '&' };
                    write!(f, "{sep}{key}={value}")?;
                }
                Ok(())
            }
            Request::Raw(bytes) => write!(f, "{} raw bytes", bytes.len()),
        }
    }
}

/// The normalized result of delivering one request.
///
/// Adapters never return errors: every way an exchange can go wrong is one of
/// these variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    /// An HTTP response was received. Header names are lowercase. `truncated`
    /// is set when the body ran past the capture limit and was cut short.
    Responded {
        status: u16,
        headers: BTreeMap<String, String>,
        body: Vec<u8>,
        truncated: bool,
    },
    TimedOut,
    ConnectionRefused,
    ConnectionReset,
    /// Bytes received from a raw socket read.
    PartialRead(Vec<u8>),
    /// The request could not be expressed, or the peer's reply was not HTTP.
    Malformed(String),
}

impl TransportOutcome {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportOutcome::Responded { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short label used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportOutcome::Responded { .. } => "responded",
            TransportOutcome::TimedOut => "timed-out",
            TransportOutcome::ConnectionRefused => "connection-refused",
            TransportOutcome::ConnectionReset => "connection-reset",
            TransportOutcome::PartialRead(_) => "partial-read",
            TransportOutcome::Malformed(_) => "malformed",
        }
    }
}

impl fmt::Display for TransportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportOutcome::Responded {
                status,
                headers,
                body,
                truncated,
            } => {
                let content_type = headers
                    .get("content-type")
                    .map(String::as_str)
                    .unwrap_or("-");
                let more = if *truncated { "+" } else { "" };
                write!(
                    f,
                    "HTTP {status} ({content_type}, {}{more} body bytes)",
                    body.len()
                )
            }
            TransportOutcome::PartialRead(bytes) => write!(f, "received b\"{}\"", escape_bytes(bytes)),
            TransportOutcome::Malformed(detail) => write!(f, "malformed: {detail}"),
            other => f.write_str(other.kind()),
        }
    }
}

/// Delivers a `Request` and normalizes whatever happens into an outcome.
pub trait Transport: Send + Sync {
    fn deliver(&self, request: &Request) -> TransportOutcome;
}

/// The service under test, reachable over both HTTP and raw TCP.
pub struct Target {
    http: HttpTransport,
    socket: SocketTransport,
}

impl Target {
    pub fn new(http: HttpTransport, socket: SocketTransport) -> Self {
        Self { http, socket }
    }
}

impl Transport for Target {
    fn deliver(&self, request: &Request) -> TransportOutcome {
        match request {
            Request::Http { .. } => self.http.deliver(request),
            Request::Raw(_) => self.socket.deliver(request),
        }
    }
}
