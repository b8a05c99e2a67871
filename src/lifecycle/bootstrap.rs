//! Bootstrap script lookup and output capture.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::remote::{OutputSink, OutputStream};

use super::LifecycleError;

/// Service installed on every new instance.
pub const DEFAULT_SERVICE: &str = "docker";

/// Locates per-OS bootstrap scripts below a root directory.
///
/// Scripts live at `<root>/<service>/<os>.sh`; when no exact match exists the
/// OS family (the text before the first `-`, e.g. `debian` for `debian-12`)
/// is tried next.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapScripts {
    root: Utf8PathBuf,
    service: String,
}

impl BootstrapScripts {
    /// Scripts for [`DEFAULT_SERVICE`] below `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            service: DEFAULT_SERVICE.to_owned(),
        }
    }

    /// Root directory searched for scripts.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Candidate paths for `os`, most specific first.
    #[must_use]
    pub fn candidates(&self, os: &str) -> Vec<Utf8PathBuf> {
        let trimmed = os.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let dir = self.root.join(&self.service);
        let mut paths = vec![dir.join(format!("{trimmed}.sh"))];
        if let Some((family, _)) = trimmed.split_once('-')
            && !family.is_empty()
        {
            paths.push(dir.join(format!("{family}.sh")));
        }
        paths
    }

    /// First existing script for `os`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ScriptNotFound`] when no candidate exists.
    pub fn resolve(&self, os: &str) -> Result<Utf8PathBuf, LifecycleError> {
        self.candidates(os)
            .into_iter()
            .find(|path| path.is_file())
            .ok_or_else(|| LifecycleError::ScriptNotFound {
                service: self.service.clone(),
                os: os.to_owned(),
            })
    }
}

/// Sends bootstrap output to the log, one event per non-empty line.
#[derive(Clone, Debug)]
pub(crate) struct LogSink {
    instance: String,
}

impl LogSink {
    pub(crate) fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }
}

impl OutputSink for LogSink {
    fn write(&self, stream: OutputStream, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            info!(instance = %self.instance, ?stream, "{line}");
        }
    }
}
