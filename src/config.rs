// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

//! Project root resolution and the optional `kiln.toml` configuration file.

use std::env::current_dir;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tectonic_errors::prelude::*;

pub fn get_root() -> Result<PathBuf> {
    Ok(current_dir()?)
}

/// The contents of an optional `kiln.toml` at the project root. Every field
/// has a sensible default, so a missing file is not an error — it just means
/// every default applies.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Source directory, relative to the project root.
    pub src: Option<PathBuf>,

    /// Target directory, relative to the project root.
    pub dst: Option<PathBuf>,

    /// Cache directory, relative to the project root. Absent disables
    /// caching.
    pub cache_dir: Option<PathBuf>,

    /// Override for the per-stage worker count. Absent means "use the
    /// host's logical CPU count".
    pub workers: Option<usize>,
}

impl Config {
    const FILE_NAME: &'static str = "kiln.toml";

    /// Load `kiln.toml` from `root`, or fall back to all-default
    /// configuration if it doesn't exist.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(Self::FILE_NAME);

        if !path.is_file() {
            return Ok(Config::default());
        }

        let text = atry!(
            fs::read_to_string(&path);
            ["failed to read `{}`", path.display()]
        );

        let config = atry!(
            toml::from_str(&text);
            ["failed to parse `{}`", path.display()]
        );

        Ok(config)
    }

    pub fn src_dir(&self, root: &Path) -> PathBuf {
        root.join(self.src.clone().unwrap_or_else(|| PathBuf::from("src")))
    }

    pub fn dst_dir(&self, root: &Path) -> PathBuf {
        root.join(self.dst.clone().unwrap_or_else(|| PathBuf::from("dst")))
    }

    pub fn cache_dir(&self, root: &Path) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|d| root.join(d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.src_dir(dir.path()), dir.path().join("src"));
        assert_eq!(config.cache_dir(dir.path()), None);
    }

    #[test]
    fn parses_present_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("kiln.toml"),
            "src = \"content\"\ndst = \"public\"\ncache_dir = \".cache\"\nworkers = 2\n",
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.src_dir(dir.path()), dir.path().join("content"));
        assert_eq!(config.dst_dir(dir.path()), dir.path().join("public"));
        assert_eq!(config.cache_dir(dir.path()), Some(dir.path().join(".cache")));
        assert_eq!(config.workers, Some(2));
    }
}
