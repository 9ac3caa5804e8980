use std::env;
use std::ffi::OsString;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirError {
    #[error("Directory not found: {0}")]
    DirNotFound(String),
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type DirResult<T> = Result<T, DirError>;

/// Application name used to namespace directories.
pub static APP_NAME: &str = "category-clustering";

/// Cache root for downloaded model artifacts.
///
/// Resolves to `$XDG_CACHE_HOME/category-clustering`, falling back to
/// `~/.cache/category-clustering`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheDir;

impl Display for CacheDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "~/.cache/{}", APP_NAME)
    }
}

impl CacheDir {
    const XDG_KEY: &'static str = "XDG_CACHE_HOME";
    const REL_PATH: &'static str = ".cache";

    /// Resolve the cache path from the process environment.
    pub fn get_dir(&self) -> DirResult<PathBuf> {
        let home = env::home_dir()
            .or_else(|| env::var_os("HOME").map(PathBuf::from))
            .or_else(|| env::var_os("USERPROFILE").map(PathBuf::from));
        self.resolve(env::var_os(Self::XDG_KEY), home)
    }

    fn resolve(&self, xdg: Option<OsString>, home: Option<PathBuf>) -> DirResult<PathBuf> {
        match (xdg, home) {
            (Some(dir), _) if !dir.is_empty() => Ok(PathBuf::from(dir).join(APP_NAME)),
            (_, Some(home)) => Ok(home.join(Self::REL_PATH).join(APP_NAME)),
            _ => Err(DirError::DirNotFound(self.to_string())),
        }
    }

    /// Directory holding the files of one Hugging Face model.
    pub fn model_dir(&self, model_name: &str) -> DirResult<PathBuf> {
        Ok(Self::model_subdir(&self.get_dir()?, model_name))
    }

    fn model_subdir(root: &Path, model_name: &str) -> PathBuf {
        root.join("huggingface")
            .join("transformers")
            .join(model_name.replace('/', "_"))
    }

    /// Ensure the cache directory for a model exists, creating it asynchronously if needed.
    pub async fn ensure_model_dir_async(&self, model_name: &str) -> DirResult<PathBuf> {
        let dir = self.model_dir(model_name)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}
