// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

//! The on-disk incremental build cache.
//!
//! Keyed by CRC32-IEEE over the stage's pipeline fingerprint, the plugin
//! name, the input file's path, and its content hash (see
//! [`crate::fingerprint`] and [`crate::file::File::hash`]). Each entry is two
//! flat files: the artifact bytes, and a small JSON record of its metadata
//! and declared dependency paths.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tectonic_errors::prelude::*;
use tectonic_status_base::{tt_warning, StatusBackend};

use crate::file::File;

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    #[serde(rename = "Meta")]
    meta: BTreeMap<String, Value>,
    #[serde(rename = "RelPath")]
    rel_path: String,
    #[serde(rename = "DepPaths")]
    dep_paths: Vec<String>,
}

/// A flat-file artifact cache rooted at an optional directory. When no
/// directory is configured, every lookup misses and every store is a no-op:
/// the engine can always run uncached.
pub struct FileCache {
    dir: Option<PathBuf>,
}

impl FileCache {
    pub fn new(dir: PathBuf) -> Self {
        FileCache { dir: Some(dir) }
    }

    pub fn disabled() -> Self {
        FileCache { dir: None }
    }

    fn key(fingerprint: u32, plugin_name: &str, input_path: &str, input_hash: u32) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&fingerprint.to_le_bytes());
        hasher.update(plugin_name.as_bytes());
        hasher.update(input_path.as_bytes());
        hasher.update(&input_hash.to_le_bytes());
        hasher.finalize()
    }

    fn data_path(dir: &Path, key: u32, ext: &str) -> PathBuf {
        dir.join(format!("gs_{key:08x}_data{ext}"))
    }

    fn entry_path(dir: &Path, key: u32) -> PathBuf {
        dir.join(format!("gs_{key:08x}_entry.json"))
    }

    /// Persist `output` as the cached artifact for `input` at this stage.
    /// `dep_paths` are extra files (beyond `input` itself) whose mtimes also
    /// gate future retrievals.
    pub fn store_file(
        &self,
        fingerprint: u32,
        plugin_name: &str,
        input: &mut File,
        output: &mut File,
        dep_paths: &[String],
    ) -> Result<()> {
        let dir = match &self.dir {
            Some(d) => d,
            None => return Ok(()),
        };

        atry!(
            fs::create_dir_all(dir);
            ["failed to create cache directory `{}`", dir.display()]
        );

        let input_hash = atry!(
            input.hash();
            ["failed to hash input file `{}` for caching", input.rel_path()]
        );

        let key = Self::key(fingerprint, plugin_name, input.rel_path(), input_hash);
        let ext = Path::new(output.rel_path())
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let data_path = Self::data_path(dir, key, &ext);

        let mut tmp = atry!(
            tempfile::NamedTempFile::new_in(dir);
            ["failed to create temporary file in cache directory `{}`", dir.display()]
        );

        atry!(
            output.seek(SeekFrom::Start(0));
            ["failed to rewind output file `{}` before caching", output.rel_path()]
        );

        atry!(
            std::io::copy(output, tmp.as_file_mut());
            ["failed to write cache artifact for `{}`", output.rel_path()]
        );

        atry!(
            tmp.persist(&data_path);
            ["failed to finalize cache artifact at `{}`", data_path.display()]
        );

        let entry = CacheEntry {
            meta: output.metadata().clone(),
            rel_path: output.rel_path().to_string(),
            dep_paths: dep_paths.to_vec(),
        };

        let entry_path = Self::entry_path(dir, key);
        let entry_json = atry!(
            serde_json::to_vec_pretty(&entry);
            ["failed to serialize cache entry for `{}`", output.rel_path()]
        );

        atry!(
            fs::write(&entry_path, entry_json);
            ["failed to write cache entry `{}`", entry_path.display()]
        );

        Ok(())
    }

    /// Attempt to retrieve a prior artifact for `input` at this stage. A
    /// missing entry, missing data file, or any stale dependency is a plain
    /// miss (`Ok(None)`), never an error. Only a true I/O fault on a file
    /// that does exist surfaces as `Err`.
    pub fn retrieve_file(
        &self,
        fingerprint: u32,
        plugin_name: &str,
        input: &mut File,
    ) -> Result<Option<File>> {
        let dir = match &self.dir {
            Some(d) => d,
            None => return Ok(None),
        };

        let input_hash = atry!(
            input.hash();
            ["failed to hash input file `{}` for cache lookup", input.rel_path()]
        );

        let key = Self::key(fingerprint, plugin_name, input.rel_path(), input_hash);
        let entry_path = Self::entry_path(dir, key);

        let entry_bytes = match fs::read(&entry_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // A corrupt entry is treated as a miss rather than a hard error, the
        // same way the build cache degrades gracefully on a bad bincode blob.
        let entry: CacheEntry = match serde_json::from_slice(&entry_bytes) {
            Ok(e) => e,
            Err(_) => return Ok(None),
        };

        let ext = Path::new(&entry.rel_path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let data_path = Self::data_path(dir, key, &ext);

        let data_meta = match fs::metadata(&data_path) {
            Ok(m) => m,
            Err(_) => return Ok(None),
        };

        let output_mtime = match data_meta.modified() {
            Ok(t) => t,
            Err(_) => return Ok(None),
        };

        if input.mod_time() > output_mtime {
            return Ok(None);
        }

        // Any missing dependency path is a miss; we never distinguish
        // "missing" from "stale" here, per the safer reading of the spec.
        for dep in &entry.dep_paths {
            match fs::metadata(dep).and_then(|m| m.modified()) {
                Ok(dep_mtime) if dep_mtime <= output_mtime => {}
                _ => return Ok(None),
            }
        }

        let mut cached = atry!(
            File::from_asset(entry.rel_path.clone(), data_path);
            ["failed to open cached artifact for `{}`", input.rel_path()]
        );
        cached.set_metadata(entry.meta);

        Ok(Some(cached))
    }

    /// Make sure the cache directory exists, warning (but never failing the
    /// run) if it cannot be created.
    pub fn warn_if_unusable(&self, status: &mut dyn StatusBackend) {
        if let Some(dir) = &self.dir {
            if !dir.exists() {
                if let Err(e) = fs::create_dir_all(dir) {
                    tt_warning!(status, "could not create cache directory `{}`: {}", dir.display(), e);
                }
            }
        }
    }
}
