use std::collections::HashMap;

use tracing::trace;

use crate::buffer::{Buffer, StreamKind};
use crate::element::{Muxer, Writer};
use crate::error::ElementError;
use crate::time::ClockTime;

/// Concatenates buffer payloads in the order they are released.
///
/// Also tracks the media span it has written so it can emulate a container
/// with reserved header space for robust muxing.
#[derive(Debug, Default)]
pub struct RawMuxer {
    pads: Vec<String>,
    counters: HashMap<StreamKind, u32>,
    reserved_max_duration: Option<ClockTime>,
    first_ts: Option<ClockTime>,
    last_end: Option<ClockTime>,
}

impl RawMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pads(&self) -> &[String] {
        &self.pads
    }

    fn written_duration(&self) -> ClockTime {
        match (self.first_ts, self.last_end) {
            (Some(first), Some(end)) => end.saturating_sub(first),
            _ => ClockTime::ZERO,
        }
    }
}

impl Muxer for RawMuxer {
    fn request_pad(&mut self, kind: StreamKind, name: Option<&str>) -> Result<String, ElementError> {
        let pad = match name {
            Some(name) => name.to_string(),
            None => {
                let counter = self.counters.entry(kind).or_insert(0);
                let pad = format!("{}_{}", kind.prefix(), *counter);
                *counter += 1;
                pad
            }
        };
        if self.pads.contains(&pad) {
            return Err(ElementError::Other(format!("Pad '{pad}' already exists")));
        }
        self.pads.push(pad.clone());
        Ok(pad)
    }

    fn release_pad(&mut self, pad: &str) {
        self.pads.retain(|p| p != pad);
    }

    fn push_buffer(
        &mut self,
        pad: &str,
        buffer: &Buffer,
        out: &mut dyn Writer,
    ) -> Result<(), ElementError> {
        if !self.pads.iter().any(|p| p == pad) {
            return Err(ElementError::UnknownPad(pad.to_string()));
        }
        if let Some(ts) = buffer.pts.or(buffer.dts) {
            if self.first_ts.is_none_or(|first| ts < first) {
                self.first_ts = Some(ts);
            }
            let end = ts + buffer.duration.unwrap_or(ClockTime::ZERO);
            if self.last_end.is_none_or(|last| end > last) {
                self.last_end = Some(end);
            }
        }
        trace!(pad, size = buffer.size(), "Muxing buffer");
        out.write(&buffer.data)
    }

    fn flush(&mut self) {
        self.first_ts = None;
        self.last_end = None;
    }

    fn supports_reserved_duration(&self) -> bool {
        true
    }

    fn set_reserved_max_duration(&mut self, duration: ClockTime) -> Result<(), ElementError> {
        self.reserved_max_duration = (!duration.is_zero()).then_some(duration);
        Ok(())
    }

    fn reserved_duration_remaining(&self) -> Option<ClockTime> {
        self.reserved_max_duration
            .map(|max| max.saturating_sub(self.written_duration()))
    }
}
