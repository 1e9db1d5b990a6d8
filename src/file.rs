// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

//! The lazily-materialized byte container that flows through the pipeline.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::Value;
use tectonic_errors::prelude::*;

/// Where a [`File`]'s bytes currently live.
enum Content {
    /// Bytes are already resident in memory, with a read cursor.
    Memory(Cursor<Vec<u8>>),

    /// Bytes live on disk at `path` and have not yet been read into memory.
    /// Once loaded, the file transitions to `Memory` and never goes back.
    Asset {
        path: PathBuf,
        loaded: Option<Cursor<Vec<u8>>>,
    },
}

/// One logical file as it flows through the pipeline: some bytes, some
/// metadata, and a relative path that (absent a plugin renaming it) becomes
/// its location under the target directory.
pub struct File {
    rel_path: String,
    content: Content,
    metadata: BTreeMap<String, Value>,
    size: u64,
    mod_time: SystemTime,
    hash: Option<u32>,
}

impl File {
    /// Build a file whose content is already in memory.
    pub fn from_bytes<P: Into<String>>(rel_path: P, bytes: Vec<u8>, mod_time: SystemTime) -> Self {
        let size = bytes.len() as u64;

        File {
            rel_path: normalize_rel_path(rel_path.into()),
            content: Content::Memory(Cursor::new(bytes)),
            metadata: BTreeMap::new(),
            size,
            mod_time,
            hash: None,
        }
    }

    /// Build a file backed by an on-disk asset. Fails if the asset does not
    /// exist or is not a regular file; does not read its contents.
    pub fn from_asset<P: Into<String>>(rel_path: P, asset_path: PathBuf) -> Result<Self> {
        let meta = atry!(
            fs::metadata(&asset_path);
            ["failed to stat asset file `{}`", asset_path.display()]
        );

        ensure!(
            meta.is_file(),
            "asset path `{}` is not a regular file",
            asset_path.display()
        );

        let mod_time = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        Ok(File {
            rel_path: normalize_rel_path(rel_path.into()),
            content: Content::Asset {
                path: asset_path,
                loaded: None,
            },
            metadata: BTreeMap::new(),
            size: meta.len(),
            mod_time,
            hash: None,
        })
    }

    pub fn rel_path(&self) -> &str {
        &self.rel_path
    }

    /// Change this file's destination path. Invalidates the cached hash since
    /// the path does not currently participate in it, but callers that rename
    /// files typically also adjust metadata, so we invalidate defensively.
    pub fn set_rel_path<P: Into<String>>(&mut self, rel_path: P) {
        self.rel_path = normalize_rel_path(rel_path.into());
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mod_time(&self) -> SystemTime {
        self.mod_time
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Replace the whole metadata map at once, e.g. when restoring a file
    /// retrieved from the cache.
    pub fn set_metadata(&mut self, metadata: BTreeMap<String, Value>) {
        self.metadata = metadata;
        self.hash = None;
    }

    pub fn set_value<K: Into<String>>(&mut self, key: K, value: Value) {
        self.metadata.insert(key.into(), value);
        self.hash = None;
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Copy another file's metadata entries into this one. `from`'s values
    /// win on key collision.
    pub fn inherit_values(&mut self, from: &File) {
        for (k, v) in &from.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
        self.hash = None;
    }

    /// True if the asset-backed content has not yet been read into memory.
    fn is_unloaded(&self) -> bool {
        matches!(
            self.content,
            Content::Asset { loaded: None, .. }
        )
    }

    /// Ensure the content is resident in memory, reading the backing asset
    /// if needed.
    fn ensure_loaded(&mut self) -> Result<()> {
        if let Content::Asset { path, loaded } = &mut self.content {
            if loaded.is_none() {
                let bytes = atry!(
                    fs::read(&path);
                    ["failed to read asset file `{}`", path.display()]
                );
                *loaded = Some(Cursor::new(bytes));
            }
        }

        Ok(())
    }

    fn cursor_mut(&mut self) -> &mut Cursor<Vec<u8>> {
        match &mut self.content {
            Content::Memory(c) => c,
            Content::Asset { loaded, .. } => loaded.as_mut().expect("asset must be loaded"),
        }
    }

    /// A deterministic 32-bit hash over the file's bytes and metadata. Used
    /// only for cache keying, not as a cryptographic digest. Cached after
    /// first computation; invalidated by any metadata mutation.
    pub fn hash(&mut self) -> Result<u32> {
        if let Some(h) = self.hash {
            return Ok(h);
        }

        self.ensure_loaded()?;

        let mut hasher = crc32fast::Hasher::new();

        match &self.content {
            Content::Memory(c) => hasher.update(c.get_ref()),
            Content::Asset { loaded, .. } => {
                hasher.update(loaded.as_ref().expect("loaded above").get_ref())
            }
        }

        // BTreeMap iterates in sorted key order, giving a stable encoding.
        let encoded = atry!(
            serde_json::to_vec(&self.metadata);
            ["failed to encode metadata for file `{}`", self.rel_path]
        );
        hasher.update(&encoded);

        let h = hasher.finalize();
        self.hash = Some(h);
        Ok(h)
    }

    /// Write this file's full contents to `targetDir/relPath`, creating
    /// parent directories as needed. Skips the write if an existing output
    /// file is already at least as fresh as this one.
    pub fn export(&mut self, target_dir: &Path) -> Result<()> {
        let out_path = target_dir.join(&self.rel_path);

        if let Ok(existing) = fs::metadata(&out_path) {
            if let Ok(existing_mtime) = existing.modified() {
                if existing_mtime >= self.mod_time {
                    return Ok(());
                }
            }
        }

        if let Some(parent) = out_path.parent() {
            atry!(
                fs::create_dir_all(parent);
                ["failed to create directory `{}`", parent.display()]
            );
        }

        // Stream straight from the asset when we haven't materialized it yet,
        // to avoid paying for an in-memory copy we don't otherwise need.
        if self.is_unloaded() {
            if let Content::Asset { path, .. } = &self.content {
                atry!(
                    fs::copy(path, &out_path);
                    ["failed to copy `{}` to `{}`", path.display(), out_path.display()]
                );
                return Ok(());
            }
        }

        self.ensure_loaded()?;
        self.cursor_mut().seek(SeekFrom::Start(0)).unwrap();

        let mut out = atry!(
            fs::File::create(&out_path);
            ["failed to create output file `{}`", out_path.display()]
        );

        atry!(
            io::copy(self.cursor_mut(), &mut out);
            ["failed to write output file `{}`", out_path.display()]
        );

        Ok(())
    }
}

impl Read for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_loaded()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.cursor_mut().read(buf)
    }
}

impl Seek for File {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        // Seeking to the start (or a no-op relative seek) of an unloaded
        // asset is a pure no-op: it's the common "rewind before processing"
        // pattern and must not force a load.
        if self.is_unloaded() {
            match pos {
                SeekFrom::Start(0) => return Ok(0),
                SeekFrom::Current(0) => return Ok(0),
                _ => {}
            }
        }

        self.ensure_loaded()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.cursor_mut().seek(pos)
    }
}

/// Slash-normalize a relative path: backslashes become slashes, `.`/empty
/// segments are dropped, and the result never begins with `/` or contains
/// `..`.
fn normalize_rel_path(raw: String) -> String {
    let cleaned: Vec<&str> = raw
        .replace('\\', "/")
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect();

    cleaned.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_stable_and_deterministic() {
        let mut f1 = File::from_bytes("a.txt", b"hello".to_vec(), SystemTime::now());
        let mut f2 = File::from_bytes("a.txt", b"hello".to_vec(), SystemTime::now());

        let h1 = f1.hash().unwrap();
        let h2 = f1.hash().unwrap();
        assert_eq!(h1, h2);

        let h3 = f2.hash().unwrap();
        assert_eq!(h1, h3);
    }

    #[test]
    fn hash_changes_with_metadata() {
        let mut f = File::from_bytes("a.txt", b"hello".to_vec(), SystemTime::now());
        let h1 = f.hash().unwrap();
        f.set_value("title", Value::String("hi".into()));
        let h2 = f.hash().unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn inherit_values_overwrites_existing_and_fills_missing() {
        let mut dst = File::from_bytes("a.txt", b"hi".to_vec(), SystemTime::now());
        dst.set_value("title", Value::String("old".into()));
        dst.set_value("kept", Value::String("unchanged".into()));

        let mut src = File::from_bytes("a.txt", b"hi".to_vec(), SystemTime::now());
        src.set_value("title", Value::String("new".into()));
        src.set_value("extra", Value::String("added".into()));

        dst.inherit_values(&src);

        // `src`'s value wins over `dst`'s pre-existing one.
        assert_eq!(dst.value("title"), Some(&Value::String("new".into())));
        // A key only `src` has is filled in.
        assert_eq!(dst.value("extra"), Some(&Value::String("added".into())));
        // A key only `dst` has is left alone.
        assert_eq!(dst.value("kept"), Some(&Value::String("unchanged".into())));
    }

    #[test]
    fn normalize_path_rules() {
        assert_eq!(normalize_rel_path("a/./b".into()), "a/b");
        assert_eq!(normalize_rel_path("a\\b".into()), "a/b");
        assert_eq!(normalize_rel_path("./a/b/".into()), "a/b");
    }

    #[test]
    fn seek_zero_on_unloaded_asset_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        fs::write(&path, b"contents").unwrap();

        let mut f = File::from_asset("x.txt", path).unwrap();
        assert!(f.is_unloaded());
        f.seek(SeekFrom::Start(0)).unwrap();
        assert!(f.is_unloaded());

        let mut buf = String::new();
        f.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "contents");
        assert!(!f.is_unloaded());
    }
}
