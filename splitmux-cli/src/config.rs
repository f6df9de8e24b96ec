//! Configuration file handling.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use splitmux::{ClockTime, SplitMuxConfig};

use crate::cli::RunArgs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sink: SplitMuxConfig,
}

impl AppConfig {
    /// Loads `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text)?;
        config.sink.validate()?;
        Ok(config)
    }

    /// Applies command line overrides on top of the file.
    pub fn apply(&mut self, args: &RunArgs) {
        let sink = &mut self.sink;
        if let Some(location) = &args.location {
            sink.location = Some(location.clone());
        }
        if let Some(secs) = args.max_size_time {
            sink.max_size_time = ClockTime::from_seconds_f64(secs);
        }
        if let Some(bytes) = args.max_size_bytes {
            sink.max_size_bytes = bytes;
        }
        if let Some(tc) = &args.max_size_timecode {
            sink.max_size_timecode = Some(tc.clone());
        }
        if let Some(max_files) = args.max_files {
            sink.max_files = max_files;
        }
        if let Some(start_index) = args.start_index {
            sink.start_index = start_index;
        }
        if args.async_finalize {
            sink.async_finalize = true;
        }
    }

    pub fn show(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
