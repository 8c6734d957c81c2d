//! Parameters worth remembering between sessions: the last set the robot
//! confirmed, and the best scoring set seen so far. Kept in a small RON
//! file.

use crate::params::ParameterSet;

use log::info;
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Anything that went wrong reading or writing the store.
#[derive(Debug)]
pub enum StoreError {
    /// The file could not be read or written
    Io(io::Error),
    /// The contents could not be serialized
    Ron(ron::Error),
    /// The file on disk is not a valid store
    RonSpanned(ron::de::SpannedError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            StoreError::Io(error) => Cow::from(format!("io error: {}", error)),
            StoreError::Ron(error) => Cow::from(format!("ron error: {}", error)),
            StoreError::RonSpanned(error) => Cow::from(format!("ron spanning error: {}", error)),
        };
        write!(f, "{}", description)
    }
}

impl std::error::Error for StoreError {}

/// A parameter set and the score it got.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestRun {
    /// The parameters
    pub params: ParameterSet,
    /// Their score
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Stored {
    last_known_good: Option<ParameterSet>,
    best: Option<BestRun>,
}

/// The persistent store, backed by one file.
#[derive(Debug, Clone)]
pub struct ParamStore {
    path: PathBuf,
    stored: Stored,
}

impl ParamStore {
    /// Loads the store at `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let stored = match fs::read_to_string(&path) {
            Ok(text) => ron::from_str(&text).map_err(StoreError::RonSpanned)?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => Stored::default(),
            Err(error) => return Err(StoreError::Io(error)),
        };
        Ok(Self { path, stored })
    }

    /// The last set the robot confirmed, if any.
    pub fn last_known_good(&self) -> Option<ParameterSet> {
        self.stored.last_known_good
    }

    /// The last confirmed set, or `fallback` if there is none.
    pub fn last_known_good_or(&self, fallback: ParameterSet) -> ParameterSet {
        self.stored.last_known_good.unwrap_or(fallback)
    }

    /// The best scoring set on record.
    pub fn best(&self) -> Option<BestRun> {
        self.stored.best
    }

    /// Remembers a set the robot confirmed and writes the store.
    pub fn set_last_known_good(&mut self, params: ParameterSet) -> Result<(), StoreError> {
        self.stored.last_known_good = Some(params);
        self.save()
    }

    /// Records a score. Only written if it beats the best on record.
    /// Returns true if it did.
    pub fn offer_best(&mut self, params: ParameterSet, score: f64) -> Result<bool, StoreError> {
        if self.stored.best.is_some_and(|best| best.score >= score) {
            return Ok(false);
        }
        info!("new best {:.1} with {}", score, params);
        self.stored.best = Some(BestRun { params, score });
        self.save()?;
        Ok(true)
    }

    fn save(&self) -> Result<(), StoreError> {
        let text = ron::ser::to_string_pretty(&self.stored, ron::ser::PrettyConfig::default())
            .map_err(StoreError::Ron)?;
        let mut handle = File::create(&self.path).map_err(StoreError::Io)?;
        handle.write_all(text.as_bytes()).map_err(StoreError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = ParamStore::open(dir.path().join("params.ron")).unwrap();
        assert_eq!(store.last_known_good(), None);
        assert_eq!(store.best(), None);
        assert_eq!(
            store.last_known_good_or(ParameterSet::default()),
            ParameterSet::default()
        );
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.ron");
        let good = ParameterSet::gains(2.2, 0.05, 0.3);
        {
            let mut store = ParamStore::open(&path).unwrap();
            store.set_last_known_good(good).unwrap();
            assert!(store.offer_best(good, 700.0).unwrap());
            assert!(!store.offer_best(ParameterSet::default(), 650.0).unwrap());
        }

        let store = ParamStore::open(&path).unwrap();
        assert_eq!(store.last_known_good(), Some(good));
        assert_eq!(
            store.best(),
            Some(BestRun {
                params: good,
                score: 700.0
            })
        );
    }

    #[test]
    fn test_garbage_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.ron");
        fs::write(&path, "not ron at all {").unwrap();
        assert!(matches!(
            ParamStore::open(&path),
            Err(StoreError::RonSpanned(_))
        ));
    }
}
