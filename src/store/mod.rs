//! JSON file stores for projects and drivers.
//!
//! Stores live under the nimus home directory (`~/.nimus` by default):
//!
//! ```text
//! <home>/projects/<name>.json
//! <home>/drivers/<name>.json
//! <home>/ssh/<name>, <home>/ssh/<name>.pub
//! ```
//!
//! Every mutation rewrites the affected file in full.

mod driver;
mod project;

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

pub use driver::DriverStore;
pub use project::ProjectStore;

/// Sub-directory holding project files.
pub const PROJECTS_DIR: &str = "projects";
/// Sub-directory holding driver files.
pub const DRIVERS_DIR: &str = "drivers";
/// Sub-directory holding project key pairs.
pub const SSH_DIR: &str = "ssh";

const RECORD_EXTENSION: &str = "json";

/// Errors raised by the stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Raised when adding a record whose name is taken.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Record kind (`project` or `driver`).
        kind: &'static str,
        /// Conflicting name.
        name: String,
    },
    /// Raised when a record is missing.
    #[error("{kind} '{name}' was not found")]
    NotFound {
        /// Record kind (`project` or `driver`).
        kind: &'static str,
        /// Requested name.
        name: String,
    },
    /// Raised when a name cannot be used as a file name.
    #[error("invalid {kind} name '{name}'")]
    InvalidName {
        /// Record kind (`project` or `driver`).
        kind: &'static str,
        /// Rejected name.
        name: String,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a record cannot be serialised or parsed.
    #[error("failed to encode {path}: {message}")]
    Encode {
        /// Path of the record.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Rejects names that would escape the store directory.
pub(crate) fn validate_name(kind: &'static str, name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName {
            kind,
            name: name.to_owned(),
        })
    }
}

/// A directory of `<name>.json` records.
#[derive(Debug)]
pub(crate) struct RecordDir {
    path: Utf8PathBuf,
    dir: Dir,
}

impl RecordDir {
    /// Opens `path`, creating it when missing.
    pub(crate) fn open(path: Utf8PathBuf) -> Result<Self, StoreError> {
        ensure_dir(&path)?;
        let dir = Dir::open_ambient_dir(&path, ambient_authority())
            .map_err(|err| io_error(&path, &err))?;
        Ok(Self { path, dir })
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn file_name(name: &str) -> String {
        format!("{name}.{RECORD_EXTENSION}")
    }

    /// Reads every parseable record. Unreadable files are logged and skipped.
    pub(crate) fn load_all<T: DeserializeOwned>(&self) -> Result<Vec<T>, StoreError> {
        let entries = self.dir.entries().map_err(|err| io_error(&self.path, &err))?;
        let mut file_names = Vec::new();
        for entry in entries {
            let file_name = entry
                .and_then(|item| item.file_name())
                .map_err(|err| io_error(&self.path, &err))?;
            if Utf8Path::new(&file_name).extension() == Some(RECORD_EXTENSION) {
                file_names.push(file_name);
            }
        }
        file_names.sort();

        let mut records = Vec::with_capacity(file_names.len());
        for file_name in file_names {
            let path = self.path.join(&file_name);
            let parsed = self
                .dir
                .read_to_string(&file_name)
                .map_err(|err| err.to_string())
                .and_then(|contents| {
                    serde_json::from_str::<T>(&contents).map_err(|err| err.to_string())
                });
            match parsed {
                Ok(record) => records.push(record),
                Err(message) => warn!(path = %path, error = %message, "skipping unreadable record"),
            }
        }
        Ok(records)
    }

    /// Writes `record` as `<name>.json`, replacing any previous content.
    pub(crate) fn write<T: Serialize>(&self, name: &str, record: &T) -> Result<(), StoreError> {
        let file_name = Self::file_name(name);
        let path = self.path.join(&file_name);
        let mut contents = serde_json::to_string_pretty(record).map_err(|err| StoreError::Encode {
            path: path.clone(),
            message: err.to_string(),
        })?;
        contents.push('\n');
        self.dir
            .write(&file_name, contents)
            .map_err(|err| io_error(&path, &err))
    }

    /// Deletes `<name>.json`; a missing file is not an error.
    pub(crate) fn delete(&self, name: &str) -> Result<(), StoreError> {
        let file_name = Self::file_name(name);
        match self.dir.remove_file(&file_name) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&self.path.join(&file_name), &err)),
        }
    }
}

/// Creates `path` and any missing parents.
pub(crate) fn ensure_dir(path: &Utf8Path) -> Result<(), StoreError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| io_error(path, &err))
}

/// Reads a small text file through a capability handle on its parent.
pub(crate) fn read_text(path: &Utf8Path) -> Result<String, StoreError> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| StoreError::Io {
        path: path.to_path_buf(),
        message: "path is missing a file name".to_owned(),
    })?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;
    dir.read_to_string(file_name)
        .map_err(|err| io_error(path, &err))
}
