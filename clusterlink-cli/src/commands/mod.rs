pub mod agent;
pub mod call;
pub mod config;
pub mod get;
pub mod stream;

use std::path::PathBuf;

use anyhow::{Context, Result};

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}
