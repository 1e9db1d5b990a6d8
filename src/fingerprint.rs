// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

//! The pipeline fingerprint: a rolling CRC32 over chained plugin names.
//!
//! Each stage records the fingerprint's value at the moment it is attached.
//! The value is opaque to plugins; the cache uses it to bind an artifact to
//! the exact upstream plugin sequence that produced it, so reordering or
//! adding plugins invalidates stale cache entries without an explicit
//! version bump.

/// An append-only rolling hash over plugin names.
#[derive(Clone, Default)]
pub struct Fingerprint {
    hasher: crc32fast::Hasher,
}

impl Fingerprint {
    pub fn new() -> Self {
        Fingerprint {
            hasher: crc32fast::Hasher::new(),
        }
    }

    /// Fold in the next plugin's name and return the fingerprint value after
    /// doing so. Does not consume the rolling state, so it can be called
    /// again for the next stage.
    pub fn chain(&mut self, plugin_name: &str) -> u32 {
        self.hasher.update(plugin_name.as_bytes());
        self.hasher.clone().finalize()
    }
}
