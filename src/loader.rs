// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

//! The built-in first stage: walks the source tree and dispatches one
//! [`File`] per regular file found.

use std::sync::Arc;

use tectonic_errors::prelude::*;
use walkdir::WalkDir;

use crate::file::File;
use crate::filter::{Filter, Named};
use crate::plugin::Plugin;
use crate::stage::StageContext;

pub struct Loader;

impl Named for Loader {
    fn name(&self) -> &str {
        "loader"
    }
}

impl Plugin for Loader {
    fn has_initializer(&self) -> bool {
        true
    }

    fn initialize(&self, ctx: &StageContext) -> Result<Vec<Arc<dyn Filter>>> {
        for entry in WalkDir::new(ctx.src_dir()) {
            let entry = atry!(
                entry;
                ["failed to walk source directory `{}`", ctx.src_dir().display()]
            );

            if entry.file_type().is_dir() {
                continue;
            }

            let rel = atry!(
                entry.path().strip_prefix(ctx.src_dir());
                ["failed to compute relative path for `{}`", entry.path().display()]
            );

            let rel_str = rel.to_string_lossy().replace('\\', "/");
            let file = File::from_asset(rel_str, entry.path().to_path_buf())?;
            ctx.dispatch(file)?;
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn loader_dispatches_every_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.md"), b"#x").unwrap();

        let (ctx, rx) = StageContext::for_test_rooted(dir.path().to_path_buf());
        let loader = Loader;
        loader.initialize(&ctx).unwrap();
        drop(ctx);

        let mut paths: Vec<String> = rx.iter().map(|f| f.rel_path().to_string()).collect();
        paths.sort();
        assert_eq!(paths, vec!["a.txt".to_string(), "sub/b.md".to_string()]);
    }
}
