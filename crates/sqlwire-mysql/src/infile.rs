//! LOAD DATA LOCAL INFILE sources.
//!
//! The server, not the client, names the file to upload. The engine
//! therefore never opens files itself: it asks a [`LocalInfileSource`],
//! which decides whether the request is allowed.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sqlwire_core::{ClientErrorKind, Error, Result};

use crate::config::MySqlConfig;

/// Supplies file contents for LOAD DATA LOCAL INFILE requests.
pub trait LocalInfileSource: Send + fmt::Debug {
    /// Open `filename` as requested by the server, or refuse.
    fn open(&self, filename: &str) -> Result<Box<dyn Read + Send>>;
}

/// Reads from the local filesystem subject to the configured policy.
#[derive(Debug, Clone, Default)]
pub struct FsInfileSource {
    allow_all: bool,
    directory: Option<PathBuf>,
}

impl FsInfileSource {
    /// Refuse every request.
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Serve any path.
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            directory: None,
        }
    }

    /// Serve only files inside `dir`.
    pub fn within(dir: impl Into<PathBuf>) -> Self {
        Self {
            allow_all: false,
            directory: Some(dir.into()),
        }
    }

    pub fn from_config(config: &MySqlConfig) -> Self {
        Self {
            allow_all: config.local_infile,
            directory: config.local_infile_dir.clone(),
        }
    }

    /// Resolve `filename`, enforcing the policy.
    ///
    /// Both paths are canonicalized first, so `..` components and symlinks
    /// cannot escape the allowed directory.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf> {
        let path = Path::new(filename);
        if self.allow_all {
            return Ok(path.to_path_buf());
        }

        let Some(dir) = &self.directory else {
            return Err(rejected(format!(
                "LOAD DATA LOCAL INFILE is disabled (requested '{}')",
                filename
            )));
        };

        let dir = dir.canonicalize().map_err(|e| {
            rejected(format!(
                "local infile directory {} is not accessible: {}",
                dir.display(),
                e
            ))
        })?;
        let file = path.canonicalize().map_err(|e| {
            rejected(format!("cannot access local infile '{}': {}", filename, e))
        })?;

        if file.starts_with(&dir) {
            Ok(file)
        } else {
            Err(rejected(format!(
                "'{}' is outside the allowed directory {}",
                filename,
                dir.display()
            )))
        }
    }
}

impl LocalInfileSource for FsInfileSource {
    fn open(&self, filename: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(filename)?;
        let file = File::open(&path).map_err(|e| {
            rejected(format!("cannot open '{}': {}", path.display(), e))
        })?;
        Ok(Box::new(file))
    }
}

fn rejected(message: String) -> Error {
    Error::client(ClientErrorKind::LocalInfileRejected, message)
}
