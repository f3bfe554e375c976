pub mod app;
pub mod assets;
pub mod config;
pub mod domain;
pub mod error;
pub mod extract;
pub mod gallery;
pub mod lookup;
pub mod manifest;
pub mod output;
pub mod pacing;
pub mod references;
pub mod store;
