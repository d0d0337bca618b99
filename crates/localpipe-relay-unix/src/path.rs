//! Socket path selection

use std::io;
use std::path::{Path, PathBuf};

/// Where the relay's listening socket lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixSocketPath {
    /// A fixed path; a stale file already there is replaced
    Fixed(PathBuf),
    /// A freshly generated, unused path
    Temporary(TempPathSpec),
}

impl UnixSocketPath {
    pub fn fixed(path: impl Into<PathBuf>) -> Self {
        UnixSocketPath::Fixed(path.into())
    }

    pub fn temporary(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        UnixSocketPath::Temporary(TempPathSpec::new(prefix, suffix))
    }

    pub fn resolve(&self) -> io::Result<PathBuf> {
        match self {
            UnixSocketPath::Fixed(path) => Ok(path.clone()),
            UnixSocketPath::Temporary(spec) => spec.generate(),
        }
    }
}

/// Inputs for generating a temporary socket path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TempPathSpec {
    /// Parent directory; the system temp dir when unset
    pub dir: Option<PathBuf>,
    pub prefix: String,
    pub suffix: String,
}

impl TempPathSpec {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            dir: None,
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn in_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Generate a free path.
    ///
    /// A placeholder file is created (proving the name is free and the
    /// directory writable) and removed again before returning.
    pub fn generate(&self) -> io::Result<PathBuf> {
        let dir = self.dir.clone().unwrap_or_else(std::env::temp_dir);
        let placeholder = tempfile::Builder::new()
            .prefix(&self.prefix)
            .suffix(&self.suffix)
            .tempfile_in(&dir)?;

        let path = placeholder.path().to_path_buf();
        placeholder.close()?;
        Ok(path)
    }
}
