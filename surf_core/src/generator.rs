use crate::input::GeneratedInput;
use crate::transport::HttpMethod;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Probability that a length or integer is drawn from the domain boundaries
/// (min, min+1, max-1, max) instead of the interior.
const BOUNDARY_PROBABILITY: f64 = 0.25;
/// Probability that an interior length is capped to a short value. Short
/// values reach parsers' early-exit paths more often than uniform lengths do.
const SHORT_LENGTH_PROBABILITY: f64 = 0.5;
const SHORT_LENGTH_SPAN: usize = 16;
/// Probability that a single character or byte run comes from the adversarial set.
const ADVERSARIAL_PROBABILITY: f64 = 0.2;

/// Characters that historically break URL handling, JSON encoding or text rendering.
const ADVERSARIAL_CHARS: &[char] = &[
    '\0', '\t', '\n', '\r', ' ', '"', '\'', '\\', '/', '?', '&', '=', '#', '%', '+', ';', '<',
    '>', '.', '~', '{', '}', '\u{7f}', '\u{85}', '\u{a0}', '\u{301}', '\u{200b}', '\u{202e}',
    '\u{feff}', '\u{fffd}', '\u{1f600}', '\u{10ffff}',
];

/// Byte runs that exercise HTTP framing and UTF-8 decoding.
const ADVERSARIAL_BYTES: &[&[u8]] = &[
    b"\r\n",
    b"\r\n\r\n",
    b"\x00",
    b"\xff\xfe",
    b"\xc0\x80",
    b"\xed\xa0\x80",
    b"\xf4\x90\x80\x80",
    b"GET / HTTP/1.1\r\n",
    b"Content-Length: -1\r\n",
    b"Transfer-Encoding: chunked\r\n",
    b"%00",
    b"\x1b[",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    /// The generator was constructed with an empty or inverted domain.
    #[error("Invalid generator domain: {0}")]
    InvalidDomain(String),
    /// A property received an input whose shape it cannot turn into a request.
    #[error("Input shape mismatch: expected {expected}, got {found}")]
    ShapeMismatch { expected: String, found: String },
}

/// A `Generator` produces one fresh `GeneratedInput` per call.
///
/// Generators hold only their immutable domain; all randomness comes from the
/// `rng` argument, so a value is fully determined by the RNG state it was
/// drawn from.
pub trait Generator: Send + Sync + fmt::Debug {
    fn generate(&self, rng: &mut dyn RngCore) -> Result<GeneratedInput, GeneratorError>;
}

/// Returns the RNG for trial `index` of a run seeded with `seed`.
///
/// Every trial gets its own ChaCha stream, so any single trial can be
/// regenerated without replaying the ones before it.
pub fn trial_rng(seed: u64, index: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(index);
    rng
}

fn biased_len(rng: &mut dyn RngCore, min: usize, max: usize) -> usize {
    if rng.random_bool(BOUNDARY_PROBABILITY) {
        let boundaries = [
            min,
            min.saturating_add(1).min(max),
            max.saturating_sub(1).max(min),
            max,
        ];
        return boundaries[rng.random_range(0..boundaries.len())];
    }
    if rng.random_bool(SHORT_LENGTH_PROBABILITY) {
        return rng.random_range(min..=max.min(min.saturating_add(SHORT_LENGTH_SPAN)));
    }
    rng.random_range(min..=max)
}

/// The set of characters a `TextGenerator` may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alphabet {
    /// Any Unicode scalar value.
    Unicode,
    /// Scalar values in `min..=max`.
    Range { min: char, max: char },
}

impl Alphabet {
    /// Printable ASCII, code points 32 through 126.
    pub fn printable_ascii() -> Self {
        Alphabet::Range { min: ' ', max: '~' }
    }

    pub fn contains(&self, c: char) -> bool {
        match self {
            Alphabet::Unicode => true,
            Alphabet::Range { min, max } => (*min..=*max).contains(&c),
        }
    }

    fn sample(&self, rng: &mut dyn RngCore) -> char {
        match self {
            Alphabet::Unicode => {
                // Half ASCII, a quarter BMP, a quarter anywhere.
                let upper = match rng.random_range(0..4u8) {
                    0 | 1 => 0x7F,
                    2 => 0xFFFF,
                    _ => 0x10FFFF,
                };
                char::from_u32(rng.random_range(0..=upper)).unwrap_or('\u{fffd}')
            }
            Alphabet::Range { min, max } => {
                char::from_u32(rng.random_range(*min as u32..=*max as u32)).unwrap_or(*min)
            }
        }
    }
}

/// Text with a length, in characters, inside `min_len..=max_len`.
#[derive(Debug, Clone)]
pub struct TextGenerator {
    min_len: usize,
    max_len: usize,
    alphabet: Alphabet,
    adversarial: Vec<char>,
}

impl TextGenerator {
    pub fn new(min_len: usize, max_len: usize) -> Result<Self, GeneratorError> {
        Self::with_alphabet(min_len, max_len, Alphabet::Unicode)
    }

    pub fn with_alphabet(
        min_len: usize,
        max_len: usize,
        alphabet: Alphabet,
    ) -> Result<Self, GeneratorError> {
        if min_len > max_len {
            return Err(GeneratorError::InvalidDomain(format!(
                "text length range {min_len}..={max_len} is empty"
            )));
        }
        if let Alphabet::Range { min, max } = alphabet {
            if min > max {
                return Err(GeneratorError::InvalidDomain(format!(
                    "alphabet range {:#x}..={:#x} is empty",
                    min as u32, max as u32
                )));
            }
        }
        let adversarial = ADVERSARIAL_CHARS
            .iter()
            .copied()
            .filter(|c| alphabet.contains(*c))
            .collect();
        Ok(Self {
            min_len,
            max_len,
            alphabet,
            adversarial,
        })
    }

    /// Route path segments: 1 to 20 printable ASCII characters.
    pub fn path() -> Result<Self, GeneratorError> {
        Self::with_alphabet(1, 20, Alphabet::printable_ascii())
    }

    fn sample_char(&self, rng: &mut dyn RngCore) -> char {
        if !self.adversarial.is_empty() && rng.random_bool(ADVERSARIAL_PROBABILITY) {
            return self.adversarial[rng.random_range(0..self.adversarial.len())];
        }
        self.alphabet.sample(rng)
    }
}

impl Generator for TextGenerator {
    fn generate(&self, rng: &mut dyn RngCore) -> Result<GeneratedInput, GeneratorError> {
        let len = biased_len(rng, self.min_len, self.max_len);
        let text = (0..len).map(|_| self.sample_char(rng)).collect();
        Ok(GeneratedInput::Text(text))
    }
}

/// Integers inside `min..=max`.
#[derive(Debug, Clone)]
pub struct IntegerGenerator {
    min: i64,
    max: i64,
}

impl IntegerGenerator {
    pub fn new(min: i64, max: i64) -> Result<Self, GeneratorError> {
        if min > max {
            return Err(GeneratorError::InvalidDomain(format!(
                "integer range {min}..={max} is empty"
            )));
        }
        Ok(Self { min, max })
    }
}

impl Generator for IntegerGenerator {
    fn generate(&self, rng: &mut dyn RngCore) -> Result<GeneratedInput, GeneratorError> {
        let value = if rng.random_bool(BOUNDARY_PROBABILITY) {
            let boundaries = [
                self.min,
                self.min.saturating_add(1).min(self.max),
                self.max.saturating_sub(1).max(self.min),
                self.max,
            ];
            boundaries[rng.random_range(0..boundaries.len())]
        } else {
            rng.random_range(self.min..=self.max)
        };
        Ok(GeneratedInput::Integer(value))
    }
}

/// Raw byte strings with a length inside `min_len..=max_len`.
///
/// Bytes are uniform over `0..=255` apart from the occasional adversarial run,
/// so the output carries no printable bias.
#[derive(Debug, Clone)]
pub struct BytesGenerator {
    min_len: usize,
    max_len: usize,
}

impl BytesGenerator {
    pub fn new(min_len: usize, max_len: usize) -> Result<Self, GeneratorError> {
        if min_len > max_len {
            return Err(GeneratorError::InvalidDomain(format!(
                "byte length range {min_len}..={max_len} is empty"
            )));
        }
        Ok(Self { min_len, max_len })
    }
}

impl Generator for BytesGenerator {
    fn generate(&self, rng: &mut dyn RngCore) -> Result<GeneratedInput, GeneratorError> {
        let len = biased_len(rng, self.min_len, self.max_len);
        let mut bytes = Vec::with_capacity(len);
        while bytes.len() < len {
            if rng.random_bool(ADVERSARIAL_PROBABILITY / 2.0) {
                let run = ADVERSARIAL_BYTES[rng.random_range(0..ADVERSARIAL_BYTES.len())];
                let take = run.len().min(len - bytes.len());
                bytes.extend_from_slice(&run[..take]);
            } else {
                bytes.push(rng.random::<u8>());
            }
        }
        Ok(GeneratedInput::Bytes(bytes))
    }
}

/// One value out of a fixed, closed set.
#[derive(Debug, Clone)]
pub struct EnumGenerator {
    variants: Vec<String>,
}

impl EnumGenerator {
    pub fn new<S: Into<String>>(
        variants: impl IntoIterator<Item = S>,
    ) -> Result<Self, GeneratorError> {
        let variants: Vec<String> = variants.into_iter().map(Into::into).collect();
        if variants.is_empty() {
            return Err(GeneratorError::InvalidDomain(
                "enum generator needs at least one variant".to_string(),
            ));
        }
        Ok(Self { variants })
    }

    /// GET, POST, PUT, DELETE and PATCH.
    pub fn http_methods() -> Result<Self, GeneratorError> {
        Self::new(HttpMethod::ALL.iter().map(|m| m.as_str()))
    }
}

impl Generator for EnumGenerator {
    fn generate(&self, rng: &mut dyn RngCore) -> Result<GeneratedInput, GeneratorError> {
        let pick = rng.random_range(0..self.variants.len());
        Ok(GeneratedInput::Enum(self.variants[pick].clone()))
    }
}

/// Pairs a field name with its generator for `StructuredGenerator::new`.
pub fn field<G: Generator + 'static>(name: &str, generator: G) -> (String, Box<dyn Generator>) {
    (name.to_string(), Box::new(generator))
}

/// Composes named sub-generators into a `StructuredQuery`.
#[derive(Debug)]
pub struct StructuredGenerator {
    fields: Vec<(String, Box<dyn Generator>)>,
}

impl StructuredGenerator {
    pub fn new(fields: Vec<(String, Box<dyn Generator>)>) -> Result<Self, GeneratorError> {
        if fields.is_empty() {
            return Err(GeneratorError::InvalidDomain(
                "structured generator needs at least one field".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for (name, _) in &fields {
            if !seen.insert(name.as_str()) {
                return Err(GeneratorError::InvalidDomain(format!(
                    "duplicate field name '{name}'"
                )));
            }
        }
        Ok(Self { fields })
    }
}

impl Generator for StructuredGenerator {
    fn generate(&self, rng: &mut dyn RngCore) -> Result<GeneratedInput, GeneratorError> {
        let mut values = Vec::with_capacity(self.fields.len());
        for (name, generator) in &self.fields {
            values.push((name.clone(), generator.generate(rng)?));
        }
        Ok(GeneratedInput::StructuredQuery(values))
    }
}
