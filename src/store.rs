//! Generated-diagram storage.
//!
//! Every diagram is written once under `[storage].generated_dir` as
//! `diagram_<UTC timestamp>_<random>.drawio`, next to a `.json` sidecar
//! holding the components it was built from. Files are never rewritten;
//! renderers re-read them on every request.
//!
//! Filenames arriving from HTTP paths go through [`validate_filename`]
//! before touching the filesystem.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::models::DiagramComponents;

const ALLOWED_EXTENSIONS: &[&str] = &["drawio", "xml"];
const MAX_NAME_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The name could escape the storage directory or has the wrong extension.
    InvalidName(String),
    NotFound(String),
    Io(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidName(n) => write!(f, "invalid diagram filename: {}", n),
            StoreError::NotFound(n) => write!(f, "diagram not found: {}", n),
            StoreError::Io(e) => write!(f, "diagram storage error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Clone)]
pub struct StoredDiagram {
    pub filename: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DiagramStore {
    dir: PathBuf,
}

impl DiagramStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes a new diagram document and its components sidecar.
    pub fn save(&self, xml: &str, components: &DiagramComponents) -> Result<StoredDiagram> {
        self.save_named(xml, components, new_filename)
    }

    fn save_named(
        &self,
        xml: &str,
        components: &DiagramComponents,
        mut next_name: impl FnMut() -> String,
    ) -> Result<StoredDiagram> {
        std::fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to create diagram directory: {}", self.dir.display())
        })?;

        let (filename, path) = self.create_document(xml, &mut next_name)?;

        let sidecar = path.with_extension("json");
        let json = serde_json::to_string_pretty(components)?;
        if let Err(e) = std::fs::write(&sidecar, json) {
            eprintln!(
                "Warning: failed to write components sidecar {}: {}",
                sidecar.display(),
                e
            );
        }

        Ok(StoredDiagram { filename, path })
    }

    /// Creates the document under a fresh name, never replacing an existing file.
    fn create_document(
        &self,
        xml: &str,
        next_name: &mut impl FnMut() -> String,
    ) -> Result<(String, PathBuf)> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let filename = next_name();
            let path = self.dir.join(&filename);
            let mut file = match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    eprintln!("Warning: {} already exists, picking another name", filename);
                    continue;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create diagram: {}", path.display()))
                }
            };
            file.write_all(xml.as_bytes())
                .with_context(|| format!("Failed to write diagram: {}", path.display()))?;
            return Ok((filename, path));
        }
        bail!(
            "Failed to find an unused diagram filename after {} attempts",
            MAX_NAME_ATTEMPTS
        )
    }

    /// Resolves a client-supplied filename to an existing file.
    pub fn path_for(&self, filename: &str) -> Result<PathBuf, StoreError> {
        validate_filename(filename)?;
        let path = self.dir.join(filename);
        if !path.is_file() {
            return Err(StoreError::NotFound(filename.to_string()));
        }
        Ok(path)
    }

    pub fn read_source(&self, filename: &str) -> Result<String, StoreError> {
        let path = self.path_for(filename)?;
        std::fs::read_to_string(&path).map_err(|e| StoreError::Io(e.to_string()))
    }

    /// Components sidecar for a stored diagram, if one was written.
    pub fn read_components(&self, filename: &str) -> Option<DiagramComponents> {
        let path = self.path_for(filename).ok()?.with_extension("json");
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

/// `diagram_<YYYYmmddHHMMSS>_<8 hex>.drawio`
pub fn new_filename() -> String {
    let ts = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let rand = uuid::Uuid::new_v4().simple().to_string();
    format!("diagram_{}_{}.drawio", ts, &rand[..8])
}

/// Accepts plain file names of `[A-Za-z0-9_.-]` with a diagram extension.
pub fn validate_filename(filename: &str) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidName(filename.to_string());

    if filename.is_empty()
        || filename.len() > 255
        || filename.starts_with('.')
        || filename.contains("..")
    {
        return Err(invalid());
    }
    if !filename
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(invalid());
    }
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ALLOWED_EXTENSIONS.contains(&ext) => Ok(()),
        _ => Err(invalid()),
    }
}
