use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::element::Writer;
use crate::error::ElementError;

const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Writes fragments to the file system.
///
/// The target is truncated when opened, so a wrapped fragment index reuses
/// (and replaces) the oldest file.
pub struct FileWriter {
    location: Option<PathBuf>,
    buffer_size: usize,
    sync_on_finish: bool,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl Default for FileWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FileWriter {
    pub fn new() -> Self {
        Self {
            location: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sync_on_finish: false,
            writer: None,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl Writer for FileWriter {
    fn set_location(&mut self, location: &Path) -> Result<(), ElementError> {
        if self.writer.is_some() {
            warn!(path = %location.display(), "Changing location of an open file writer");
        }
        self.location = Some(location.to_path_buf());
        Ok(())
    }

    fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    fn start(&mut self) -> Result<(), ElementError> {
        let path = self
            .location
            .as_ref()
            .ok_or_else(|| ElementError::Other("No file location set".to_string()))?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            debug!(path = %path.display(), "Replacing existing file");
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        self.writer = Some(BufWriter::with_capacity(self.buffer_size, file));
        self.bytes_written = 0;
        info!(path = %path.display(), "Opened fragment file");
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ElementError> {
        let writer = self.writer.as_mut().ok_or(ElementError::NotRunning)?;
        writer.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ElementError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        if self.sync_on_finish {
            writer.get_ref().sync_all()?;
        }
        info!(
            path = %self.location.as_deref().unwrap_or(Path::new("")).display(),
            bytes = self.bytes_written,
            "Closed fragment file"
        );
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut writer) = self.writer.take()
            && let Err(e) = writer.flush()
        {
            warn!(error = %e, "Failed to flush file writer on stop");
        }
    }

    fn set_property(&mut self, name: &str, value: &str) -> Result<(), ElementError> {
        let invalid = || ElementError::InvalidPropertyValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        match name {
            "location" => self.set_location(Path::new(value)),
            "buffer-size" => {
                let size: usize = value.parse().map_err(|_| invalid())?;
                if size == 0 {
                    return Err(invalid());
                }
                self.buffer_size = size;
                Ok(())
            }
            "sync" => {
                self.sync_on_finish = value.parse().map_err(|_| invalid())?;
                Ok(())
            }
            _ => Err(ElementError::UnknownProperty(name.to_string())),
        }
    }
}
