//! Muxer and writer abstractions.
//!
//! The sink never encodes anything itself. Each fragment is produced by a
//! [`Muxer`] that turns per-stream buffers into bytes, and a [`Writer`] that
//! stores those bytes somewhere (usually a file). Both are created by name
//! through an [`ElementRegistry`], mirroring how the sink is configured.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::{Buffer, Gap, StreamKind};
use crate::config::ElementConfig;
use crate::elements::{FileWriter, RawMuxer};
use crate::error::{ElementError, SplitMuxError};
use crate::segment::Segment;
use crate::time::ClockTime;

/// Combines the buffers of several streams into one byte stream.
pub trait Muxer: Send {
    /// Allocates an input pad for a stream and returns its name.
    ///
    /// `name` is the requested pad name from the pad map, if any.
    fn request_pad(&mut self, kind: StreamKind, name: Option<&str>) -> Result<String, ElementError>;

    fn release_pad(&mut self, pad: &str);

    fn start(&mut self) -> Result<(), ElementError> {
        Ok(())
    }

    fn segment(&mut self, _pad: &str, _segment: &Segment) -> Result<(), ElementError> {
        Ok(())
    }

    fn gap(&mut self, _pad: &str, _gap: &Gap) -> Result<(), ElementError> {
        Ok(())
    }

    fn push_buffer(
        &mut self,
        pad: &str,
        buffer: &Buffer,
        out: &mut dyn Writer,
    ) -> Result<(), ElementError>;

    /// Called once every pad reached end of stream; writes any trailer.
    fn finish(&mut self, _out: &mut dyn Writer) -> Result<(), ElementError> {
        Ok(())
    }

    /// Drops buffered data so the muxer can begin a new file.
    fn flush(&mut self) {}

    /// Returns the muxer to its freshly constructed state, keeping its pads.
    fn reset(&mut self) {
        self.flush();
    }

    fn stop(&mut self) {}

    fn set_property(&mut self, name: &str, _value: &str) -> Result<(), ElementError> {
        Err(ElementError::UnknownProperty(name.to_string()))
    }

    fn load_preset(&mut self, preset: &str) -> Result<(), ElementError> {
        Err(ElementError::UnsupportedPreset(preset.to_string()))
    }

    /// Whether the muxer can reserve header space up front.
    fn supports_reserved_duration(&self) -> bool {
        false
    }

    fn set_reserved_max_duration(&mut self, _duration: ClockTime) -> Result<(), ElementError> {
        Err(ElementError::Unsupported("reserved-max-duration"))
    }

    /// Media duration that still fits in the reserved header space.
    fn reserved_duration_remaining(&self) -> Option<ClockTime> {
        None
    }
}

/// Stores the bytes produced by a muxer.
pub trait Writer: Send {
    fn set_location(&mut self, _location: &Path) -> Result<(), ElementError> {
        Err(ElementError::Unsupported("location"))
    }

    fn location(&self) -> Option<&Path> {
        None
    }

    /// Opens the output; called once per fragment.
    fn start(&mut self) -> Result<(), ElementError>;

    fn write(&mut self, data: &[u8]) -> Result<(), ElementError>;

    /// Flushes and closes the output at the end of a fragment.
    fn finish(&mut self) -> Result<(), ElementError>;

    /// Releases the output without finishing it.
    fn stop(&mut self);

    fn set_property(&mut self, name: &str, _value: &str) -> Result<(), ElementError> {
        Err(ElementError::UnknownProperty(name.to_string()))
    }

    fn load_preset(&mut self, preset: &str) -> Result<(), ElementError> {
        Err(ElementError::UnsupportedPreset(preset.to_string()))
    }
}

pub trait MuxerFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Muxer>, ElementError>;
}

impl<F> MuxerFactory for F
where
    F: Fn() -> Result<Box<dyn Muxer>, ElementError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Muxer>, ElementError> {
        self()
    }
}

pub trait WriterFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Writer>, ElementError>;
}

impl<F> WriterFactory for F
where
    F: Fn() -> Result<Box<dyn Writer>, ElementError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Writer>, ElementError> {
        self()
    }
}

/// Named muxer and writer factories.
#[derive(Clone)]
pub struct ElementRegistry {
    muxers: HashMap<String, Arc<dyn MuxerFactory>>,
    writers: HashMap<String, Arc<dyn WriterFactory>>,
}

impl fmt::Debug for ElementRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementRegistry")
            .field("muxers", &self.muxers.keys().collect::<Vec<_>>())
            .field("writers", &self.writers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ElementRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ElementRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            muxers: HashMap::new(),
            writers: HashMap::new(),
        }
    }

    /// A registry holding the built-in `rawmux` and `filesink`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_muxer("rawmux", || -> Result<Box<dyn Muxer>, ElementError> {
            Ok(Box::new(RawMuxer::new()))
        });
        registry.register_writer("filesink", || -> Result<Box<dyn Writer>, ElementError> {
            Ok(Box::new(FileWriter::new()))
        });
        registry
    }

    pub fn register_muxer(&mut self, name: impl Into<String>, factory: impl MuxerFactory + 'static) {
        self.muxers.insert(name.into(), Arc::new(factory));
    }

    pub fn register_writer(
        &mut self,
        name: impl Into<String>,
        factory: impl WriterFactory + 'static,
    ) {
        self.writers.insert(name.into(), Arc::new(factory));
    }

    pub fn has_muxer(&self, name: &str) -> bool {
        self.muxers.contains_key(name)
    }

    pub fn has_writer(&self, name: &str) -> bool {
        self.writers.contains_key(name)
    }

    pub(crate) fn make_muxer(
        &self,
        config: &ElementConfig,
        name: &str,
    ) -> Result<Box<dyn Muxer>, SplitMuxError> {
        let factory =
            self.muxers
                .get(&config.factory)
                .ok_or_else(|| SplitMuxError::MissingFactory {
                    kind: "muxer",
                    factory: config.factory.clone(),
                })?;
        let mut muxer = factory
            .create()
            .map_err(|e| SplitMuxError::creation(name, e))?;

        if let Some(preset) = &config.preset
            && let Err(e) = muxer.load_preset(preset)
        {
            warn!(element = name, preset, error = %e, "Could not load muxer preset");
        }
        for (key, value) in &config.properties {
            if let Err(e) = muxer.set_property(key, value) {
                warn!(element = name, property = key, error = %e, "Could not set muxer property");
            }
        }
        debug!(element = name, factory = %config.factory, "Created muxer");
        Ok(muxer)
    }

    pub(crate) fn make_writer(
        &self,
        config: &ElementConfig,
        name: &str,
    ) -> Result<Box<dyn Writer>, SplitMuxError> {
        let factory =
            self.writers
                .get(&config.factory)
                .ok_or_else(|| SplitMuxError::MissingFactory {
                    kind: "writer",
                    factory: config.factory.clone(),
                })?;
        let mut writer = factory
            .create()
            .map_err(|e| SplitMuxError::creation(name, e))?;

        if let Some(preset) = &config.preset
            && let Err(e) = writer.load_preset(preset)
        {
            warn!(element = name, preset, error = %e, "Could not load writer preset");
        }
        for (key, value) in &config.properties {
            if let Err(e) = writer.set_property(key, value) {
                warn!(element = name, property = key, error = %e, "Could not set writer property");
            }
        }
        debug!(element = name, factory = %config.factory, "Created writer");
        Ok(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_factory_is_reported() {
        let registry = ElementRegistry::new();
        let err = registry
            .make_muxer(&ElementConfig::new("nope"), "muxer")
            .err()
            .unwrap();
        assert!(matches!(err, SplitMuxError::MissingFactory { kind: "muxer", .. }));
    }

    #[test]
    fn bad_properties_only_warn() {
        let registry = ElementRegistry::with_defaults();
        let config = ElementConfig::new("rawmux")
            .with_preset("fast")
            .with_property("no-such-property", "1");
        assert!(registry.make_muxer(&config, "muxer").is_ok());
    }
}
