use serde::{Deserialize, Serialize};
use std::fmt;

/// A value produced by a `Generator` for exactly one trial.
///
/// Inputs are immutable once produced. Composite inputs (`StructuredQuery`)
/// keep their fields in generation order so that rendering and hashing are
/// stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GeneratedInput {
    Text(String),
    Integer(i64),
    Bytes(Vec<u8>),
    Enum(String),
    StructuredQuery(Vec<(String, GeneratedInput)>),
}

impl GeneratedInput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            GeneratedInput::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            GeneratedInput::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            GeneratedInput::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&str> {
        match self {
            GeneratedInput::Enum(s) => Some(s),
            _ => None,
        }
    }

    /// Looks up a named field of a `StructuredQuery`.
    pub fn field(&self, name: &str) -> Option<&GeneratedInput> {
        match self {
            GeneratedInput::StructuredQuery(fields) => fields
                .iter()
                .find(|(field_name, _)| field_name == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    /// Hex MD5 of the canonical JSON encoding.
    ///
    /// Used to name persisted findings and to tell inputs apart in reports;
    /// it is not a security boundary.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_else(|_| format!("{self}").into_bytes());
        format!("{:x}", md5::compute(canonical))
    }
}

impl fmt::Display for GeneratedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneratedInput::Text(s) => write!(f, "{s:?}"),
            GeneratedInput::Integer(n) => write!(f, "{n}"),
            GeneratedInput::Bytes(b) => write!(f, "b\"{}\"", escape_bytes(b)),
            GeneratedInput::Enum(s) => write!(f, "{s}"),
            GeneratedInput::StructuredQuery(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Renders arbitrary bytes with ASCII escapes (`\x00`, `\r`, `\"`).
pub fn escape_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .flat_map(|b| std::ascii::escape_default(*b))
        .map(char::from)
        .collect()
}
