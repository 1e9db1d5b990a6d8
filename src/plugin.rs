// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

//! The plugin contract: what a stage's payload must provide.

use tectonic_errors::prelude::*;

use crate::file::File;
use crate::filter::{Filter, Named};
use crate::stage::StageContext;

/// A pipeline plugin. Capabilities are explicit boolean flags rather than
/// runtime type inspection: a plugin declares up front which of
/// initialize/process/finalize it implements, and the scheduler only calls
/// the ones it advertises.
pub trait Plugin: Named + Send + Sync {
    fn has_initializer(&self) -> bool {
        false
    }

    fn has_processor(&self) -> bool {
        false
    }

    fn has_finalizer(&self) -> bool {
        false
    }

    /// Called once before any files are processed. Returns the stage-local
    /// filters (in addition to the ambient stack) that gate this stage's
    /// `process` calls.
    fn initialize(&self, _ctx: &StageContext) -> Result<Vec<std::sync::Arc<dyn Filter>>> {
        Ok(Vec::new())
    }

    /// Called once per accepted file, possibly concurrently from multiple
    /// worker threads. Implementations dispatch zero or more output files via
    /// `ctx.dispatch` before returning.
    fn process(&self, _ctx: &StageContext, _file: File) -> Result<()> {
        Ok(())
    }

    /// Called once after all files for this stage have been processed.
    fn finalize(&self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }
}
