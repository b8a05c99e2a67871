//! Project key pair generation through `ssh-keygen`.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::process::{CommandError, CommandRunner};
use crate::store::read_text;

/// Comment embedded in generated keys.
pub const KEY_COMMENT: &str = "nimus";

/// Errors raised while preparing a project key pair.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum KeyGenError {
    /// Raised when `ssh-keygen` cannot be started.
    #[error(transparent)]
    Spawn(#[from] CommandError),
    /// Raised when `ssh-keygen` exits unsuccessfully.
    #[error("ssh-keygen exited with status {code:?}: {stderr}")]
    Failed {
        /// Exit code, when available.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when only one half of a key pair exists on disk.
    #[error("key pair at {path} is incomplete; remove it or restore the missing half")]
    Incomplete {
        /// Private key path.
        path: Utf8PathBuf,
    },
    /// Raised when the public key cannot be read back.
    #[error("failed to read public key {path}: {message}")]
    Read {
        /// Public key path.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Path of the public half for `private_key`.
#[must_use]
pub fn public_key_path(private_key: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{private_key}.pub"))
}

/// Generates RSA key pairs with an external `ssh-keygen`.
#[derive(Clone, Debug)]
pub struct KeyGenerator<R> {
    pub(super) runner: R,
    program: String,
}

impl<R: CommandRunner> KeyGenerator<R> {
    /// Creates a generator invoking `program`.
    pub fn new(runner: R, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    /// Makes sure a key pair exists at `private_key` and returns the public
    /// key text. Existing pairs are reused untouched.
    ///
    /// # Errors
    ///
    /// Returns [`KeyGenError`] when generation fails, when only half of a
    /// pair exists, or when the public key cannot be read.
    pub fn ensure(&self, private_key: &Utf8Path) -> Result<String, KeyGenError> {
        let public_key = public_key_path(private_key);
        match (private_key.is_file(), public_key.is_file()) {
            (true, true) => {
                debug!(path = %private_key, "reusing existing key pair");
            }
            (false, false) => self.generate(private_key)?,
            _ => {
                return Err(KeyGenError::Incomplete {
                    path: private_key.to_path_buf(),
                });
            }
        }

        read_text(&public_key)
            .map(|text| text.trim().to_owned())
            .map_err(|err| KeyGenError::Read {
                path: public_key,
                message: err.to_string(),
            })
    }

    fn generate(&self, private_key: &Utf8Path) -> Result<(), KeyGenError> {
        let args: Vec<OsString> = [
            "-t",
            "rsa",
            "-C",
            KEY_COMMENT,
            "-N",
            "",
            "-q",
            "-f",
            private_key.as_str(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        let output = self.runner.run(&self.program, &args)?;
        if !output.is_success() {
            return Err(KeyGenError::Failed {
                code: output.code,
                stderr: output.stderr.trim().to_owned(),
            });
        }
        info!(path = %private_key, "generated project key pair");
        Ok(())
    }
}
