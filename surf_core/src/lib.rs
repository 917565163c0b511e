pub mod config;
pub mod findings;
pub mod generator;
pub mod harness;
pub mod http;
pub mod input;
pub mod property;
pub mod report;
pub mod runner;
pub mod socket;
pub mod transport;

pub use config::{ConfigError, RunConfig};
pub use findings::{Finding, FindingsError, FindingsStore};
pub use generator::{Generator, GeneratorError};
pub use harness::{Harness, HarnessError};
pub use http::HttpTransport;
pub use input::GeneratedInput;
pub use property::{AutocompleteProperty, Property, PropertyVerdict, RawBytesProperty, RouteProperty};
pub use report::{FailureExample, PropertyReport, RunSummary};
pub use runner::{FuzzRunner, RunnerError, RunnerState, TrialRecord};
pub use socket::SocketTransport;
pub use transport::{HttpMethod, Request, Target, Transport, TransportOutcome};
