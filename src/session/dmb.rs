//! Immutable reference to one compiled game build.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{AppError, Result};

/// Reference to one compiled build usable by the game process.
///
/// Holds a primary directory and, when produced for hot-swap deployment,
/// a secondary copy the process can be pointed at while the primary is
/// replaced. Exactly one provider is active per session controller;
/// superseded providers are disposed on drop.
#[derive(Debug)]
pub struct DmbProvider {
    primary_dir: PathBuf,
    secondary_dir: Option<PathBuf>,
}

impl DmbProvider {
    /// Reference an existing build directory. Not swappable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the directory does not exist.
    pub fn from_directory(primary_dir: impl Into<PathBuf>) -> Result<Self> {
        let primary_dir = primary_dir.into();
        if !primary_dir.is_dir() {
            return Err(AppError::NotFound(format!(
                "build directory {} does not exist",
                primary_dir.display()
            )));
        }

        Ok(Self {
            primary_dir,
            secondary_dir: None,
        })
    }

    /// Reference a freshly compiled build with a hot-swap copy.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if either directory does not exist.
    pub fn with_secondary(
        primary_dir: impl Into<PathBuf>,
        secondary_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let provider = Self::from_directory(primary_dir)?;
        let secondary_dir = secondary_dir.into();
        if !secondary_dir.is_dir() {
            return Err(AppError::NotFound(format!(
                "secondary build directory {} does not exist",
                secondary_dir.display()
            )));
        }

        Ok(Self {
            primary_dir: provider.primary_dir.clone(),
            secondary_dir: Some(secondary_dir),
        })
    }

    /// Directory of the active build.
    #[must_use]
    pub fn primary_dir(&self) -> &Path {
        &self.primary_dir
    }

    /// Directory of the hot-swap copy, when one exists.
    #[must_use]
    pub fn secondary_dir(&self) -> Option<&Path> {
        self.secondary_dir.as_deref()
    }

    /// Whether this build carries a copy usable for in-place swap.
    #[must_use]
    pub fn swappable(&self) -> bool {
        self.secondary_dir.is_some()
    }
}

impl Drop for DmbProvider {
    fn drop(&mut self) {
        debug!(dir = %self.primary_dir.display(), "build provider disposed");
    }
}
