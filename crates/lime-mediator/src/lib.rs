//! LIME mediator daemon internals: configuration loading and the
//! configuration-backed agent directory.

pub mod config;
pub mod directory;

pub use config::{load_config, load_tls};
pub use directory::ConfigDirectory;
