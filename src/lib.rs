pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod manifest;
pub mod orchestration;
pub mod state;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
pub use manifest::EpicManifest;
