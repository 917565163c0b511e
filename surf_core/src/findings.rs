use crate::input::GeneratedInput;
use crate::report::{FailureExample, PropertyReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum FindingsError {
    #[error("Findings I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Findings path {0:?} exists but is not a directory")]
    NotADirectory(PathBuf),
    #[error("Findings serialization error at {path:?}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Serializes `finding` through a buffer and flushes it, so a short write
/// surfaces as an error instead of being lost on drop.
fn write_finding<W: Write>(writer: W, path: &Path, finding: &Finding) -> Result<(), FindingsError> {
    let mut writer = BufWriter::new(writer);
    serde_json::to_writer_pretty(&mut writer, finding).map_err(|source| {
        FindingsError::Serialization {
            path: path.to_path_buf(),
            source,
        }
    })?;
    writer.flush().map_err(|source| FindingsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes into a dotfile next to `path` and renames it into place. A failed
/// write never leaves a partial file under the final name.
fn write_atomically(path: &Path, finding: &Finding) -> Result<(), FindingsError> {
    let io_err = |source| FindingsError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = path.with_file_name(format!(".{file_name}.tmp"));

    let file = File::create(&staging).map_err(io_err)?;
    if let Err(e) = write_finding(file, path, finding) {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    fs::rename(&staging, path).map_err(io_err)
}

/// A persisted failing input: enough to re-run it with `--seed` and `--replay`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Finding {
    pub property: String,
    pub reason: String,
    pub seed: u64,
    pub trial: u64,
    pub input: GeneratedInput,
    pub outcome: String,
    pub recorded_at: DateTime<Utc>,
}

/// Directory of failing inputs, one JSON file per property and input.
///
/// Files are named `<property>-<fingerprint>.json`, so recording the same
/// failure twice leaves the first file untouched.
#[derive(Debug)]
pub struct FindingsStore {
    dir: PathBuf,
}

impl FindingsStore {
    const EXTENSION: &'static str = "json";

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, FindingsError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|source| FindingsError::Io {
                path: dir.clone(),
                source,
            })?;
        } else if !dir.is_dir() {
            return Err(FindingsError::NotADirectory(dir));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, property: &str, input: &GeneratedInput) -> PathBuf {
        self.dir
            .join(format!("{property}-{}", input.fingerprint()))
            .with_extension(Self::EXTENSION)
    }

    /// Writes `example` unless a finding for the same input already exists.
    /// Returns the path and whether a new file was created.
    pub fn record(
        &self,
        property: &str,
        seed: u64,
        example: &FailureExample,
    ) -> Result<(PathBuf, bool), FindingsError> {
        let path = self.path_for(property, &example.input);
        if path.exists() {
            return Ok((path, false));
        }

        let finding = Finding {
            property: property.to_string(),
            reason: example.reason.clone(),
            seed,
            trial: example.trial,
            input: example.input.clone(),
            outcome: example.outcome.clone(),
            recorded_at: Utc::now(),
        };
        write_atomically(&path, &finding)?;
        Ok((path, true))
    }

    /// Persists every distinct failure in `report`. Returns the newly created paths.
    pub fn record_report(&self, report: &PropertyReport) -> Result<Vec<PathBuf>, FindingsError> {
        let mut created = Vec::new();
        for example in &report.failures {
            let (path, is_new) = self.record(&report.property, report.seed, example)?;
            if is_new {
                info!(property = %report.property, path = %path.display(), "Recorded finding");
                created.push(path);
            }
        }
        Ok(created)
    }

    /// Loads every finding in the directory, sorted by file name.
    pub fn load_all(&self) -> Result<Vec<Finding>, FindingsError> {
        let io_err = |source| FindingsError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let is_finding = path.is_file()
                && path.extension().is_some_and(|ext| ext == Self::EXTENSION)
                && !path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'));
            if is_finding {
                paths.push(path);
            }
        }
        paths.sort();

        paths
            .into_iter()
            .map(|path| {
                let file = File::open(&path).map_err(|source| FindingsError::Io {
                    path: path.clone(),
                    source,
                })?;
                serde_json::from_reader(BufReader::new(file))
                    .map_err(|source| FindingsError::Serialization { path, source })
            })
            .collect()
    }
}
