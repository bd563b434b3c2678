//! Data source descriptors.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Where the compressed audio comes from: a file path or a URI, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    Path(PathBuf),
    Uri(Url),
}

impl DataSource {
    /// Parse user input into a data source.
    ///
    /// Anything with a URL scheme other than `file` stays a URI; `file://`
    /// URIs and bare paths become paths.
    pub fn parse(input: &str) -> Result<Self> {
        match Url::parse(input) {
            // Single letter schemes are Windows drive prefixes, not URIs.
            Ok(url) if url.scheme().len() > 1 => Self::from_url(url),
            _ => Ok(Self::Path(PathBuf::from(input))),
        }
    }

    /// Build a data source from an already parsed URL.
    pub fn from_url(url: Url) -> Result<Self> {
        if url.scheme() == "file" {
            return url
                .to_file_path()
                .map(Self::Path)
                .map_err(|()| Error::Source(format!("Invalid file URI: {url}")));
        }
        Ok(Self::Uri(url))
    }

    /// The local path, if this source is a file.
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            Self::Uri(_) => None,
        }
    }

    /// Extension hint for format probing.
    pub fn extension(&self) -> Option<String> {
        let name = match self {
            Self::Path(path) => path.file_name()?.to_str()?.to_string(),
            Self::Uri(url) => url.path_segments()?.next_back()?.to_string(),
        };
        let (_, ext) = name.rsplit_once('.')?;
        Some(ext.to_ascii_lowercase())
    }
}

impl From<PathBuf> for DataSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for DataSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<Url> for DataSource {
    fn from(url: Url) -> Self {
        Self::from_url(url.clone()).unwrap_or(Self::Uri(url))
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Uri(url) => write!(f, "{url}"),
        }
    }
}
