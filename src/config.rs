use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

pub const CELL_LOAD_ENV: &str = "UNIVERSE_CELL_LOAD_COUNT";
pub const VIEW_RADIUS_ENV: &str = "UNIVERSE_VIEW_RADIUS";
pub const MAX_RETRIES_ENV: &str = "UNIVERSE_MAX_RETRIES";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root cells reloaded per transaction at startup.
    pub cell_load_count: usize,
    /// Radius of the sphere around a view cell inside which root graphs are visible to it.
    pub view_radius: f32,
    /// Attempts per transactional task before giving up on conflicts.
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cell_load_count: 5,
            view_radius: 64.0,
            max_retries: 8,
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validated()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Defaults overridden by whatever `UNIVERSE_*` variables are set.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup(CELL_LOAD_ENV) {
            self.cell_load_count = parse(CELL_LOAD_ENV, &v)?;
        }
        if let Some(v) = lookup(VIEW_RADIUS_ENV) {
            self.view_radius = parse(VIEW_RADIUS_ENV, &v)?;
        }
        if let Some(v) = lookup(MAX_RETRIES_ENV) {
            self.max_retries = parse(MAX_RETRIES_ENV, &v)?;
        }
        self.validated()
    }

    fn validated(self) -> Result<Self> {
        if self.cell_load_count == 0 {
            return Err(Error::config("cell_load_count must be at least 1"));
        }
        if !(self.view_radius > 0.0) {
            return Err(Error::config(format!("view_radius must be positive, got {}", self.view_radius)));
        }
        if self.max_retries == 0 {
            return Err(Error::config("max_retries must be at least 1"));
        }
        Ok(self)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{key}: unable to parse {value:?}")))
}
