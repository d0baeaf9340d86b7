//! Watermark tracker: the timestamp boundary between ingested and not-yet-ingested
//! records, plus its optional on-disk checkpoint.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Monotonically non-decreasing timestamp cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    current: DateTime<Utc>,
}

impl Watermark {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { current: start }
    }

    /// Lower bound (exclusive) for the next fetch.
    pub fn current(&self) -> DateTime<Utc> {
        self.current
    }

    /// Moves the watermark to `candidate` if it is strictly newer. Returns whether
    /// it moved.
    pub fn advance(&mut self, candidate: DateTime<Utc>) -> bool {
        if candidate > self.current {
            debug!(from = %self.current, to = %candidate, "Watermark advanced");
            self.current = candidate;
            true
        } else {
            false
        }
    }
}

/// Where the watermark starts when no checkpoint exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Beginning of time: every record in the store is new.
    Earliest,
    /// A fixed distance before process start.
    Lookback(Duration),
    At(DateTime<Utc>),
}

impl StartPosition {
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            StartPosition::Earliest => DateTime::<Utc>::UNIX_EPOCH,
            StartPosition::Lookback(d) => now - *d,
            StartPosition::At(t) => *t,
        }
    }
}

impl FromStr for StartPosition {
    type Err = String;

    /// Accepts `earliest`, `lookback:<minutes>` or an RFC 3339 instant.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("earliest") {
            return Ok(StartPosition::Earliest);
        }
        if let Some(minutes) = s.strip_prefix("lookback:") {
            let minutes: i64 = minutes
                .trim()
                .parse()
                .map_err(|e| format!("invalid lookback minutes '{minutes}': {e}"))?;
            return Ok(StartPosition::Lookback(Duration::minutes(minutes)));
        }
        DateTime::parse_from_rfc3339(s)
            .map(|dt| StartPosition::At(dt.with_timezone(&Utc)))
            .map_err(|e| format!("invalid start position '{s}': {e}"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read watermark state {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse watermark state {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write watermark state {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    watermark: DateTime<Utc>,
}

/// JSON file holding the last watermark, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct WatermarkFile {
    path: PathBuf,
}

impl WatermarkFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when the file does not exist yet.
    pub fn load(&self) -> Result<Option<DateTime<Utc>>, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let cp: Checkpoint =
            serde_json::from_str(&content).map_err(|source| StateError::Parse {
                path: self.path.clone(),
                source,
            })?;
        info!(path = %self.path.display(), watermark = %cp.watermark, "Loaded watermark checkpoint");
        Ok(Some(cp.watermark))
    }

    pub fn save(&self, watermark: &Watermark) -> Result<(), StateError> {
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(write_err)?;
        let body = serde_json::to_vec(&Checkpoint {
            watermark: watermark.current(),
        })
        .map_err(|e| write_err(std::io::Error::other(e)))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(&body).map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        debug!(path = %self.path.display(), watermark = %watermark.current(), "Saved watermark checkpoint");
        Ok(())
    }
}

/// Initial watermark: a present checkpoint wins over the configured start position.
pub fn initial_watermark(
    start: &StartPosition,
    state: Option<&WatermarkFile>,
    now: DateTime<Utc>,
) -> Result<Watermark, StateError> {
    if let Some(file) = state {
        if let Some(ts) = file.load()? {
            return Ok(Watermark::new(ts));
        }
    }
    let ts = start.resolve(now);
    info!(watermark = %ts, ?start, "No checkpoint found, starting from configured position");
    Ok(Watermark::new(ts))
}
