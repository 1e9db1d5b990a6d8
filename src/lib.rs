// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

//! `kiln`: the execution core of a static-site generator. Reads a tree of
//! input files, pushes them through an ordered pipeline of plugins, and
//! writes the result to a target directory, with an on-disk incremental
//! build cache and a pluggable filter stack in between.

pub mod cache;
pub mod config;
pub mod engine;
pub mod file;
pub mod filter;
pub mod fingerprint;
pub mod loader;
pub mod plugin;
pub mod stage;
pub mod worker_status;

pub use cache::FileCache;
pub use engine::{Engine, EngineOptions, Fault};
pub use file::File;
pub use filter::{Filter, Named};
pub use loader::Loader;
pub use plugin::Plugin;
pub use stage::StageContext;
