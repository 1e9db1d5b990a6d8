// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

//! Named predicates that gate which files a stage actually processes.

use tectonic_errors::prelude::*;

use crate::file::File;
use crate::stage::StageContext;

/// A component that can be identified by name in diagnostics and fault
/// records. Shared by [`crate::plugin::Plugin`] and [`Filter`] rather than
/// duplicated, since both are named the same way.
pub trait Named {
    fn name(&self) -> &str;
}

/// A named, possibly-failing acceptance predicate. Filters are evaluated in
/// order for every file a stage sees (unless the stage has no processor, in
/// which case they are never evaluated at all); the first rejection or error
/// short-circuits the chain.
pub trait Filter: Named + Send + Sync {
    fn accept(&self, ctx: &StageContext, file: &File) -> Result<bool>;
}

/// A filter that accepts files whose relative path ends with one of the
/// given extensions (each including the leading dot, e.g. `".txt"`).
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExtensionFilter {
            extensions: extensions.into_iter().map(Into::into).collect(),
        }
    }
}

impl Named for ExtensionFilter {
    fn name(&self) -> &str {
        "extension-filter"
    }
}

impl Filter for ExtensionFilter {
    fn accept(&self, _ctx: &StageContext, file: &File) -> Result<bool> {
        Ok(self
            .extensions
            .iter()
            .any(|ext| file.rel_path().ends_with(ext.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageContext;
    use std::time::SystemTime;

    #[test]
    fn extension_filter_accepts_matching_suffix() {
        let f = ExtensionFilter::new([".txt", ".md"]);
        let (ctx, _rx) = StageContext::for_test();

        let txt = File::from_bytes("a.txt", b"x".to_vec(), SystemTime::now());
        let png = File::from_bytes("a.png", b"x".to_vec(), SystemTime::now());

        assert!(f.accept(&ctx, &txt).unwrap());
        assert!(!f.accept(&ctx, &png).unwrap());
    }
}
