use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};

/// Storage trait for received files.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Resolve the destination path for a declared filename.
    fn destination(&self, filename: &str) -> Result<PathBuf>;

    /// Create (or truncate) the destination for a declared filename.
    async fn create(&self, filename: &str) -> Result<(PathBuf, File)>;
}

/// How a filename announced by a peer is mapped onto the save directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathPolicy {
    /// Join the announced name onto the save directory unchanged.
    /// Names such as `../x` or absolute paths escape the directory.
    Verbatim,
    /// Refuse any name that would resolve outside the save directory.
    #[default]
    Confine,
}

impl std::str::FromStr for PathPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "verbatim" => Ok(Self::Verbatim),
            "confine" => Ok(Self::Confine),
            other => anyhow::bail!("unknown path policy: {} (expected verbatim or confine)", other),
        }
    }
}

/// Local filesystem storage rooted at a save directory.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    save_dir: PathBuf,
    policy: PathPolicy,
}

impl LocalStorage {
    pub fn new(save_dir: PathBuf, policy: PathPolicy) -> Result<Self> {
        std::fs::create_dir_all(&save_dir)
            .with_context(|| format!("Failed to create save directory {}", save_dir.display()))?;

        Ok(Self { save_dir, policy })
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn destination(&self, filename: &str) -> Result<PathBuf> {
        if self.policy == PathPolicy::Confine {
            validate_filename(filename)?;
        }
        Ok(self.save_dir.join(filename))
    }

    async fn create(&self, filename: &str) -> Result<(PathBuf, File)> {
        let path = self.destination(filename)?;

        // Nested relative names get their parents created on demand
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let file = File::create(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;

        tracing::debug!("Opened destination {}", path.display());
        Ok((path, file))
    }
}

/// Reject names that would leave the save directory.
pub fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("empty filename");
    }

    if name.starts_with("\\\\") {
        anyhow::bail!("UNC path not allowed: {}", name);
    }
    if has_drive_prefix(name) {
        anyhow::bail!("drive prefix not allowed: {}", name);
    }

    let path = Path::new(name);
    if path.is_absolute() || name.starts_with('/') || name.starts_with('\\') {
        anyhow::bail!("absolute path not allowed: {}", name);
    }

    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => anyhow::bail!("path escapes save directory: {}", name),
        }
    }

    // Backslash separators are not components on unix, check them by hand
    if name.split(|c| c == '/' || c == '\\').any(|part| part == "..") {
        anyhow::bail!("path escapes save directory: {}", name);
    }

    Ok(())
}

/// `C:`, `C:\..` or `C:/..`; a colon later in the name is an ordinary character.
fn has_drive_prefix(name: &str) -> bool {
    match name.as_bytes() {
        [letter, b':'] => letter.is_ascii_alphabetic(),
        [letter, b':', sep, ..] => letter.is_ascii_alphabetic() && (*sep == b'/' || *sep == b'\\'),
        _ => false,
    }
}
