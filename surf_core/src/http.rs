use crate::transport::{HttpMethod, Request, Transport, TransportOutcome};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::io::{self, Read};
use std::time::Duration;
use tracing::debug;

/// Sends HTTP requests against a base URL and captures the raw response.
///
/// 4xx and 5xx responses are ordinary outcomes here; only failures to obtain
/// a response at all become non-`Responded` variants. The body is captured
/// as bytes and never decoded.
pub struct HttpTransport {
    agent: ureq::Agent,
    base_url: String,
    max_body_bytes: usize,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        connect_timeout: Duration,
        max_body_bytes: usize,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .timeout_connect(connect_timeout)
            .max_idle_connections(0)
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_body_bytes,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn send(&self, method: HttpMethod, path: &str, query: &[(String, String)]) -> TransportOutcome {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.agent.request(method.as_str(), &url);
        for (key, value) in query {
            request = request.query(key, value);
        }

        match request.call() {
            Ok(response) | Err(ureq::Error::Status(_, response)) => self.capture(response),
            Err(ureq::Error::Transport(transport)) => {
                let outcome = classify_transport_error(&transport);
                debug!(%url, error = %transport, outcome = outcome.kind(), "HTTP transport failure");
                outcome
            }
        }
    }

    fn capture(&self, response: ureq::Response) -> TransportOutcome {
        let status = response.status();
        let mut headers = BTreeMap::new();
        for name in response.headers_names() {
            let values = response.all(&name).join(", ");
            headers.insert(name.to_ascii_lowercase(), values);
        }

        // One byte past the limit tells a full body from a cut one.
        let mut body = Vec::new();
        let read = response
            .into_reader()
            .take(self.max_body_bytes as u64 + 1)
            .read_to_end(&mut body);
        match read {
            Ok(_) => {
                let truncated = body.len() > self.max_body_bytes;
                if truncated {
                    debug!(status, limit = self.max_body_bytes, "HTTP body truncated");
                    body.truncate(self.max_body_bytes);
                }
                TransportOutcome::Responded {
                    status,
                    headers,
                    body,
                    truncated,
                }
            }
            Err(e) => {
                debug!(status, error = %e, "HTTP body read failed");
                classify_io_kind(e.kind()).unwrap_or(TransportOutcome::ConnectionReset)
            }
        }
    }
}

impl Transport for HttpTransport {
    fn deliver(&self, request: &Request) -> TransportOutcome {
        match request {
            Request::Http {
                method,
                path,
                query,
            } => self.send(*method, path, query),
            Request::Raw(_) => {
                TransportOutcome::Malformed("raw payloads cannot be sent over HTTP".to_string())
            }
        }
    }
}

fn classify_io_kind(kind: io::ErrorKind) -> Option<TransportOutcome> {
    match kind {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Some(TransportOutcome::TimedOut),
        io::ErrorKind::ConnectionRefused => Some(TransportOutcome::ConnectionRefused),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(TransportOutcome::ConnectionReset),
        _ => None,
    }
}

fn classify_transport_error(error: &ureq::Transport) -> TransportOutcome {
    let mut source = StdError::source(error);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if let Some(outcome) = classify_io_kind(io_err.kind()) {
                return outcome;
            }
        }
        source = err.source();
    }

    match error.kind() {
        ureq::ErrorKind::Dns | ureq::ErrorKind::ConnectionFailed => {
            TransportOutcome::ConnectionRefused
        }
        ureq::ErrorKind::Io => TransportOutcome::ConnectionReset,
        _ => TransportOutcome::Malformed(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn transport(base_url: &str, timeout: Duration) -> HttpTransport {
        HttpTransport::new(base_url, timeout, Duration::from_secs(1), 64 * 1024)
    }

    fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte) {
                Ok(0) | Err(_) => break,
                Ok(_) => head.push(byte[0]),
            }
        }
        String::from_utf8_lossy(&head).into_owned()
    }

    /// Accepts one connection, replies with `response` and returns the request head.
    fn serve_once(response: &'static [u8]) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let head = read_head(&mut stream);
            stream.write_all(response).unwrap();
            head
        });
        (format!("http://{addr}"), handle)
    }

    fn search(q: &str, limit: &str) -> Request {
        Request::Http {
            method: HttpMethod::Get,
            path: "/api/destinations/search".to_string(),
            query: vec![
                ("q".to_string(), q.to_string()),
                ("limit".to_string(), limit.to_string()),
            ],
        }
    }

    #[test]
    fn captures_status_lowercase_headers_and_body() {
        let (base_url, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 19\r\nConnection: close\r\n\r\n{\"destinations\":[]}",
        );
        let outcome = transport(&base_url, Duration::from_secs(2)).deliver(&search("ab", "1"));
        let head = server.join().unwrap();

        assert!(
            head.starts_with("GET /api/destinations/search?q=ab&limit=1 HTTP/1.1"),
            "unexpected request head: {head}"
        );
        match outcome {
            TransportOutcome::Responded {
                status,
                headers,
                body,
                truncated,
            } => {
                assert!(!truncated);
                assert_eq!(status, 200);
                assert_eq!(
                    headers.get("content-type").map(String::as_str),
                    Some("application/json")
                );
                assert_eq!(body, b"{\"destinations\":[]}");
            }
            other => panic!("Expected Responded, got {other:?}"),
        }
    }

    #[test]
    fn error_statuses_are_responses_not_failures() {
        let (base_url, server) = serve_once(
            b"HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        let outcome = transport(&base_url, Duration::from_secs(2)).deliver(&search("ab", "1"));
        server.join().unwrap();
        assert_eq!(outcome.status(), Some(429));
    }

    #[test]
    fn query_values_are_percent_encoded() {
        let (base_url, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        transport(&base_url, Duration::from_secs(2)).deliver(&search("a b&c#d", "7"));
        let head = server.join().unwrap();
        let request_line = head.lines().next().unwrap_or_default();
        assert!(request_line.contains("%26c"), "{request_line}");
        assert!(request_line.contains("%23d"), "{request_line}");
        assert!(request_line.contains("limit=7"), "{request_line}");
    }

    #[test]
    fn oversized_body_is_flagged_as_truncated() {
        let (base_url, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 39\r\nConnection: close\r\n\r\n{\"destinations\":[1,2,3,4,5,6,7,8,9,10]}",
        );
        let http = HttpTransport::new(&base_url, Duration::from_secs(2), Duration::from_secs(1), 16);
        let outcome = http.deliver(&search("ab", "1"));
        server.join().unwrap();
        match outcome {
            TransportOutcome::Responded {
                status,
                body,
                truncated,
                ..
            } => {
                assert_eq!(status, 200);
                assert!(truncated);
                assert_eq!(body.len(), 16);
            }
            other => panic!("Expected Responded, got {other:?}"),
        }
    }

    #[test]
    fn body_at_the_limit_is_not_truncated() {
        let (base_url, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nabcd",
        );
        let http = HttpTransport::new(&base_url, Duration::from_secs(2), Duration::from_secs(1), 4);
        let outcome = http.deliver(&search("ab", "1"));
        server.join().unwrap();
        assert!(matches!(
            outcome,
            TransportOutcome::Responded { truncated: false, ref body, .. } if body == b"abcd"
        ));
    }

    #[test]
    fn raw_query_delimiters_reach_the_server() {
        let (base_url, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        let request = Request::Http {
            method: HttpMethod::Get,
            path: "/api/destinations/search?q=a&b=c&limit=3".to_string(),
            query: Vec::new(),
        };
        transport(&base_url, Duration::from_secs(2)).deliver(&request);
        let head = server.join().unwrap();
        assert!(
            head.starts_with("GET /api/destinations/search?q=a&b=c&limit=3 HTTP/1.1"),
            "{head}"
        );
    }

    #[test]
    fn closed_port_is_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let outcome = transport(&format!("http://127.0.0.1:{port}"), Duration::from_secs(1))
            .deliver(&search("ab", "1"));
        assert_eq!(outcome, TransportOutcome::ConnectionRefused);
    }

    #[test]
    fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_head(&mut stream);
            thread::sleep(Duration::from_millis(800));
        });
        let outcome = transport(&format!("http://{addr}"), Duration::from_millis(200))
            .deliver(&search("ab", "1"));
        server.join().unwrap();
        assert_eq!(outcome, TransportOutcome::TimedOut);
    }

    #[test]
    fn non_http_reply_is_malformed() {
        let (base_url, server) = serve_once(b"garbage garbage\r\n\r\n");
        let outcome = transport(&base_url, Duration::from_secs(2)).deliver(&search("ab", "1"));
        server.join().unwrap();
        assert!(
            matches!(outcome, TransportOutcome::Malformed(_)),
            "Expected Malformed, got {outcome:?}"
        );
    }

    #[test]
    fn raw_requests_are_rejected_without_network_io() {
        let outcome = transport("http://127.0.0.1:9", Duration::from_secs(1))
            .deliver(&Request::Raw(vec![1, 2, 3]));
        assert!(matches!(outcome, TransportOutcome::Malformed(_)));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let http = transport("http://localhost:5001/", Duration::from_secs(1));
        assert_eq!(http.base_url(), "http://localhost:5001");
    }
}
