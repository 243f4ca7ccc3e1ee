//! Durable per-project manifest persistence.
//!
//! Layout: `<projects_dir>/<id>/manifest.json`, rewritten whole with
//! write-then-rename. Manifests are schema-validated on every load; the
//! store rejects records a restarted orchestrator could not trust.

use std::path::{Path, PathBuf};

use vellum_core::error::{Error, Result};
use vellum_core::id::ProjectId;
use vellum_core::jsonio;
use vellum_core::manifest::Manifest;

/// Filesystem-backed manifest store.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    projects_dir: PathBuf,
    max_retries: u32,
    fallback_chain: Vec<String>,
}

impl ManifestStore {
    /// Creates a store rooted at `projects_dir`.
    #[must_use]
    pub fn new(projects_dir: PathBuf, max_retries: u32, fallback_chain: Vec<String>) -> Self {
        Self {
            projects_dir,
            max_retries,
            fallback_chain,
        }
    }

    /// The directory holding one project's files.
    #[must_use]
    pub fn project_dir(&self, id: ProjectId) -> PathBuf {
        self.projects_dir.join(id.to_string())
    }

    fn manifest_path(&self, id: ProjectId) -> PathBuf {
        self.project_dir(id).join("manifest.json")
    }

    /// Persists a new manifest.
    ///
    /// # Errors
    ///
    /// Fails when a manifest already exists for the id, or on filesystem
    /// failure.
    pub fn create(&self, manifest: &Manifest) -> Result<()> {
        let path = self.manifest_path(manifest.id);
        if path.exists() {
            return Err(Error::storage(format!(
                "manifest already exists for project {}",
                manifest.id
            )));
        }
        jsonio::write_json_atomic(&path, manifest)
    }

    /// Loads and validates a manifest.
    ///
    /// # Errors
    ///
    /// [`Error::ProjectNotFound`] when no manifest exists; validation
    /// errors when the record violates the schema invariants.
    pub fn load(&self, id: ProjectId) -> Result<Manifest> {
        let path = self.manifest_path(id);
        if !path.exists() {
            return Err(Error::ProjectNotFound { id: id.to_string() });
        }
        let manifest: Manifest = jsonio::read_json(&path)?;
        manifest.validate(self.max_retries, &self.fallback_chain)?;
        Ok(manifest)
    }

    /// Loads, applies an updater closure, stamps `updated_at` and saves.
    ///
    /// # Errors
    ///
    /// Propagates load and save failures, and any error the updater
    /// returns; nothing is persisted on updater failure.
    pub fn update<F>(&self, id: ProjectId, updater: F) -> Result<Manifest>
    where
        F: FnOnce(&mut Manifest) -> Result<()>,
    {
        let mut manifest = self.load(id)?;
        updater(&mut manifest)?;
        manifest.touch();
        self.save(&manifest)?;
        Ok(manifest)
    }

    /// Persists a manifest in place.
    ///
    /// # Errors
    ///
    /// Returns the underlying filesystem error.
    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        jsonio::write_json_atomic(&self.manifest_path(manifest.id), manifest)
    }

    /// Lists every project id with a manifest on disk.
    ///
    /// Unparseable directory names are skipped; they are not ours.
    ///
    /// # Errors
    ///
    /// Returns the underlying filesystem error when the projects dir
    /// cannot be read (a missing dir yields an empty list).
    pub fn list_ids(&self) -> Result<Vec<ProjectId>> {
        if !self.projects_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.projects_dir)
            .map_err(|e| Error::filesystem(&self.projects_dir, &e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::filesystem(&self.projects_dir, &e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = name.parse::<ProjectId>() {
                    if self.manifest_path(id).exists() {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Writes a sibling file into the project directory (narration
    /// scripts, render hand-offs).
    ///
    /// # Errors
    ///
    /// Returns the underlying filesystem error.
    pub fn write_sibling(&self, id: ProjectId, file_name: &str, content: &str) -> Result<PathBuf> {
        let dir = self.project_dir(id);
        std::fs::create_dir_all(&dir).map_err(|e| Error::filesystem(&dir, &e))?;
        let path = dir.join(file_name);
        std::fs::write(&path, content).map_err(|e| Error::filesystem(&path, &e))?;
        Ok(path)
    }

    /// The projects root.
    #[must_use]
    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }
}
