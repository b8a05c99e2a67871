//! Project records and their SSH key pairs.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::model::{Instance, Project};

use super::{
    PROJECTS_DIR, RecordDir, SSH_DIR, StoreError, ensure_dir, read_text, validate_name,
};

const KIND: &str = "project";

/// In-memory view of every project, written through to disk.
#[derive(Debug)]
pub struct ProjectStore {
    records: RecordDir,
    ssh_dir: Utf8PathBuf,
    projects: BTreeMap<String, Project>,
}

impl ProjectStore {
    /// Loads every project under `home`.
    ///
    /// Projects whose file cannot be parsed or whose key pair cannot be read
    /// are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the store directories cannot be
    /// created or listed.
    pub fn load(home: &Utf8Path) -> Result<Self, StoreError> {
        let records = RecordDir::open(home.join(PROJECTS_DIR))?;
        let ssh_dir = home.join(SSH_DIR);
        ensure_dir(&ssh_dir)?;

        let mut projects = BTreeMap::new();
        for mut project in records.load_all::<Project>()? {
            let private_key = ssh_dir.join(&project.name);
            let public_path = ssh_dir.join(format!("{}.pub", project.name));
            match read_text(&public_path) {
                Ok(public_key) if private_key.is_file() => {
                    project.public_key = public_key.trim().to_owned();
                    project.private_key = private_key;
                    projects.insert(project.name.clone(), project);
                }
                Ok(_) => warn!(project = %project.name, path = %private_key, "private key missing; skipping project"),
                Err(err) => warn!(project = %project.name, error = %err, "public key unreadable; skipping project"),
            }
        }
        debug!(count = projects.len(), dir = %records.path(), "projects loaded");

        Ok(Self {
            records,
            ssh_dir,
            projects,
        })
    }

    /// Directory holding project key pairs.
    #[must_use]
    pub fn ssh_dir(&self) -> &Utf8Path {
        &self.ssh_dir
    }

    /// Path of the private key for project `name`.
    #[must_use]
    pub fn key_path(&self, name: &str) -> Utf8PathBuf {
        self.ssh_dir.join(name)
    }

    /// Looks up a project.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Project> {
        self.projects.get(name)
    }

    /// Returns `true` when the project exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.projects.contains_key(name)
    }

    /// Iterates over projects in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    /// Adds a new project and persists it. The in-memory entry is dropped
    /// again if the write fails.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] for a duplicate name, or the
    /// persistence error.
    pub fn add(&mut self, project: Project) -> Result<(), StoreError> {
        validate_name(KIND, &project.name)?;
        if self.contains(&project.name) {
            return Err(StoreError::AlreadyExists {
                kind: KIND,
                name: project.name,
            });
        }
        let name = project.name.clone();
        self.projects.insert(name.clone(), project);
        if let Err(err) = self.persist(&name) {
            self.projects.remove(&name);
            return Err(err);
        }
        Ok(())
    }

    /// Deletes a project file. Key files are left in place.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown projects, or the
    /// file system error.
    pub fn remove(&mut self, name: &str) -> Result<Project, StoreError> {
        if !self.contains(name) {
            return Err(not_found(name));
        }
        self.records.delete(name)?;
        self.projects.remove(name).ok_or_else(|| not_found(name))
    }

    /// Writes project `name` to disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown projects, or the
    /// serialisation or file system error.
    pub fn persist(&self, name: &str) -> Result<(), StoreError> {
        let project = self.get(name).ok_or_else(|| not_found(name))?;
        self.records.write(name, project)
    }

    /// Inserts (or replaces) an instance and persists the project.
    ///
    /// The in-memory insert is kept even when the write fails.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown projects, or the
    /// persistence error.
    pub fn insert_instance(&mut self, project: &str, instance: Instance) -> Result<(), StoreError> {
        let entry = self
            .projects
            .get_mut(project)
            .ok_or_else(|| not_found(project))?;
        entry.instances.insert(instance.name.clone(), instance);
        self.persist(project)
    }

    /// Removes an instance and persists the project.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown projects, or the
    /// persistence error.
    pub fn remove_instance(
        &mut self,
        project: &str,
        instance: &str,
    ) -> Result<Option<Instance>, StoreError> {
        let entry = self
            .projects
            .get_mut(project)
            .ok_or_else(|| not_found(project))?;
        let removed = entry.instances.remove(instance);
        self.persist(project)?;
        Ok(removed)
    }
}

fn not_found(name: &str) -> StoreError {
    StoreError::NotFound {
        kind: KIND,
        name: name.to_owned(),
    }
}
