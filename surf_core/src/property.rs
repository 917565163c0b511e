use crate::generator::{
    BytesGenerator, EnumGenerator, Generator, GeneratorError, IntegerGenerator,
    StructuredGenerator, TextGenerator, field,
};
use crate::input::GeneratedInput;
use crate::transport::{HttpMethod, Request, TransportOutcome};
use serde_json::Value as JsonValue;

/// Statuses the destination search endpoint may legitimately return.
pub const AUTOCOMPLETE_STATUSES: [u16; 4] = [200, 400, 429, 500];
/// Statuses any route may return for any method.
pub const ROUTE_STATUSES: [u16; 9] = [200, 201, 204, 400, 401, 403, 404, 405, 422];
/// Rate-limited responses carry no body contract.
pub const RATE_LIMITED: u16 = 429;
/// What a well-behaved listener answers to garbage, if it answers at all.
pub const BAD_REQUEST_MARKER: &[u8] = b"HTTP/1.1 400 Bad Request";

pub const DEFAULT_AUTOCOMPLETE_PATH: &str = "/api/destinations/search";

/// The result of checking one outcome against one property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyVerdict {
    Pass,
    /// The target violated the property for `input`.
    Fail { reason: String, input: GeneratedInput },
    /// The outcome is outside the property's jurisdiction; neither verified
    /// nor violated.
    Skipped { reason: String },
}

impl PropertyVerdict {
    pub fn is_fail(&self) -> bool {
        matches!(self, PropertyVerdict::Fail { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            PropertyVerdict::Pass => "pass",
            PropertyVerdict::Fail { .. } => "fail",
            PropertyVerdict::Skipped { .. } => "skipped",
        }
    }
}

fn fail(reason: impl Into<String>, input: &GeneratedInput) -> PropertyVerdict {
    PropertyVerdict::Fail {
        reason: reason.into(),
        input: input.clone(),
    }
}

fn skipped(reason: impl Into<String>) -> PropertyVerdict {
    PropertyVerdict::Skipped {
        reason: reason.into(),
    }
}

/// An invariant checked across many generated inputs.
///
/// A property owns the generator that feeds it, knows how to turn a generated
/// input into a `Request`, and judges the resulting outcome. `check` must be
/// pure: the same input and outcome always yield the same verdict.
pub trait Property: Send + Sync {
    /// Stable identifier used on the command line and in reports.
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn generator(&self) -> &dyn Generator;

    /// Builds the request for `input`. An input of the wrong shape is a
    /// harness bug and aborts the batch.
    fn request(&self, input: &GeneratedInput) -> Result<Request, GeneratorError>;

    fn check(&self, input: &GeneratedInput, outcome: &TransportOutcome) -> PropertyVerdict;
}

fn shape_mismatch(expected: &str, input: &GeneratedInput) -> GeneratorError {
    GeneratorError::ShapeMismatch {
        expected: expected.to_string(),
        found: input.to_string(),
    }
}

fn text_field<'a>(input: &'a GeneratedInput, name: &str) -> Result<&'a str, GeneratorError> {
    input
        .field(name)
        .and_then(GeneratedInput::as_text)
        .ok_or_else(|| shape_mismatch(&format!("text field '{name}'"), input))
}

/// Arbitrary method and path combinations must yield a status from
/// `ROUTE_STATUSES`. Failing to reach the target is never a violation.
#[derive(Debug)]
pub struct RouteProperty {
    generator: StructuredGenerator,
}

impl RouteProperty {
    pub const NAME: &'static str = "route-methods";

    pub fn new() -> Result<Self, GeneratorError> {
        let generator = StructuredGenerator::new(vec![
            field("method", EnumGenerator::http_methods()?),
            field("path", TextGenerator::path()?),
        ])?;
        Ok(Self { generator })
    }
}

impl Property for RouteProperty {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Any method against any fuzzed route returns a well-known status"
    }

    fn generator(&self) -> &dyn Generator {
        &self.generator
    }

    fn request(&self, input: &GeneratedInput) -> Result<Request, GeneratorError> {
        let method = input
            .field("method")
            .and_then(GeneratedInput::as_enum)
            .and_then(|m| m.parse::<HttpMethod>().ok())
            .ok_or_else(|| shape_mismatch("HTTP method field 'method'", input))?;
        let path = text_field(input, "path")?;
        Ok(Request::Http {
            method,
            path: format!("/{path}"),
            query: Vec::new(),
        })
    }

    fn check(&self, input: &GeneratedInput, outcome: &TransportOutcome) -> PropertyVerdict {
        match outcome {
            TransportOutcome::Responded { status, .. } if ROUTE_STATUSES.contains(status) => {
                PropertyVerdict::Pass
            }
            TransportOutcome::Responded { status, .. } => {
                fail(format!("unexpected status {status}"), input)
            }
            other => skipped(format!("network failure: {}", other.kind())),
        }
    }
}

/// The destination search endpoint answers every `q`/`limit` combination
/// with a known status, and with a JSON body carrying `destinations` or
/// `error` unless it is rate limiting.
#[derive(Debug)]
pub struct AutocompleteProperty {
    endpoint: String,
    raw_query: bool,
    generator: StructuredGenerator,
}

impl AutocompleteProperty {
    pub const NAME: &'static str = "autocomplete-params";

    pub fn new(endpoint: &str) -> Result<Self, GeneratorError> {
        let generator = StructuredGenerator::new(vec![
            field("q", TextGenerator::new(2, 1000)?),
            field("limit", IntegerGenerator::new(1, 1000)?),
        ])?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            raw_query: false,
            generator,
        })
    }

    /// Splices `q` into the URL unencoded, so `&`, `=` and `#` inside it reach
    /// the server's query-string parser as delimiters.
    pub fn with_raw_query(mut self, raw_query: bool) -> Self {
        self.raw_query = raw_query;
        self
    }

    fn check_response(
        &self,
        input: &GeneratedInput,
        status: u16,
        content_type: Option<&str>,
        body: &[u8],
        truncated: bool,
    ) -> PropertyVerdict {
        if !AUTOCOMPLETE_STATUSES.contains(&status) {
            return fail(format!("unexpected status {status}"), input);
        }
        if status == RATE_LIMITED {
            return PropertyVerdict::Pass;
        }

        match content_type {
            Some(ct) if ct.contains("application/json") => {}
            Some(ct) => {
                return fail(
                    format!("status {status}: content-type {ct:?} is not application/json"),
                    input,
                );
            }
            None => return fail(format!("status {status}: missing content-type"), input),
        }
        if truncated {
            return skipped(format!(
                "status {status}: body exceeds the capture limit, JSON not checked"
            ));
        }

        match serde_json::from_slice::<JsonValue>(body) {
            Ok(JsonValue::Object(map)) if map.contains_key("destinations") || map.contains_key("error") => {
                PropertyVerdict::Pass
            }
            Ok(_) => fail(
                format!("status {status}: JSON body has neither \"destinations\" nor \"error\""),
                input,
            ),
            Err(_) => fail(format!("status {status}: body is not valid JSON"), input),
        }
    }
}

impl Property for AutocompleteProperty {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Destination search returns a known status and a well-formed JSON body"
    }

    fn generator(&self) -> &dyn Generator {
        &self.generator
    }

    fn request(&self, input: &GeneratedInput) -> Result<Request, GeneratorError> {
        let q = text_field(input, "q")?;
        let limit = input
            .field("limit")
            .and_then(GeneratedInput::as_integer)
            .ok_or_else(|| shape_mismatch("integer field 'limit'", input))?;
        if self.raw_query {
            return Ok(Request::Http {
                method: HttpMethod::Get,
                path: format!("{}?q={q}&limit={limit}", self.endpoint),
                query: Vec::new(),
            });
        }
        Ok(Request::Http {
            method: HttpMethod::Get,
            path: self.endpoint.clone(),
            query: vec![
                ("q".to_string(), q.to_string()),
                ("limit".to_string(), limit.to_string()),
            ],
        })
    }

    fn check(&self, input: &GeneratedInput, outcome: &TransportOutcome) -> PropertyVerdict {
        match outcome {
            TransportOutcome::Responded {
                status,
                headers,
                body,
                truncated,
            } => self.check_response(
                input,
                *status,
                headers.get("content-type").map(String::as_str),
                body,
                *truncated,
            ),
            TransportOutcome::TimedOut => fail("no response within the request timeout", input),
            TransportOutcome::Malformed(detail) => {
                fail(format!("malformed response: {detail}"), input)
            }
            other => skipped(format!("target unreachable: {}", other.kind())),
        }
    }
}

/// Garbage written to the raw listener is either ignored or answered with a
/// 400 status line; any other reply is a violation.
#[derive(Debug)]
pub struct RawBytesProperty {
    generator: BytesGenerator,
}

impl RawBytesProperty {
    pub const NAME: &'static str = "raw-bytes";

    pub fn new() -> Result<Self, GeneratorError> {
        Ok(Self {
            generator: BytesGenerator::new(1, 1024)?,
        })
    }
}

impl Property for RawBytesProperty {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Malformed bytes on the raw socket are ignored or rejected with 400"
    }

    fn generator(&self) -> &dyn Generator {
        &self.generator
    }

    fn request(&self, input: &GeneratedInput) -> Result<Request, GeneratorError> {
        input
            .as_bytes()
            .map(|bytes| Request::Raw(bytes.to_vec()))
            .ok_or_else(|| shape_mismatch("bytes", input))
    }

    fn check(&self, input: &GeneratedInput, outcome: &TransportOutcome) -> PropertyVerdict {
        match outcome {
            TransportOutcome::PartialRead(bytes) if bytes.is_empty() => {
                skipped("connection produced no bytes")
            }
            TransportOutcome::PartialRead(bytes) => {
                if bytes
                    .windows(BAD_REQUEST_MARKER.len())
                    .any(|window| window == BAD_REQUEST_MARKER)
                {
                    PropertyVerdict::Pass
                } else {
                    fail("reply does not contain \"HTTP/1.1 400 Bad Request\"", input)
                }
            }
            TransportOutcome::TimedOut => skipped("no reply before the read timeout"),
            TransportOutcome::ConnectionReset => skipped("connection closed without reply"),
            TransportOutcome::ConnectionRefused => skipped("target refused the connection"),
            other => skipped(format!("not a raw socket outcome: {}", other.kind())),
        }
    }
}
