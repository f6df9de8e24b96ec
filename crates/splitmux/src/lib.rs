//! # splitmux
//!
//! A sink that takes several synchronized elementary streams (one video
//! reference plus any number of audio, subtitle and caption streams) and
//! writes them into a sequence of fragment files. Fragments are rotated only
//! at keyframe boundaries of the reference stream, so every fragment starts
//! with a decodable GOP and all streams cut at the same running time.
//!
//! ## Features
//!
//! - Split on size, duration, timecode distance or on request
//! - Explicit split points by running time, with optional keyframe requests upstream
//! - Pluggable muxers and writers through [`ElementRegistry`]
//! - Fragment naming from a `printf`-style pattern or a callback, with a ring of `max_files`
//! - Synchronous or asynchronous fragment finalization
//! - Robust muxing through reserved header space on capable muxers
//!
//! ## Component Overview
//!
//! - `sink`: the [`SplitMuxSink`] and its per-stream [`StreamHandle`]s
//! - `element`: muxer and writer traits plus the factory registry
//! - `elements`: built-in raw muxer, file writer and in-memory writer
//! - `config`: serde-backed [`SplitMuxConfig`]
//! - `events`: lifecycle notifications delivered through [`SplitMuxSink::subscribe`]
//!
//! ## License
//!
//! MIT License
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod buffer;
pub mod config;
mod context;
pub mod element;
pub mod elements;
pub mod error;
pub mod events;
mod gop;
pub mod location;
mod policy;
mod queue;
pub mod segment;
mod sink;
pub mod time;
pub mod timecode;

#[cfg(test)]
pub mod test_utils;

pub use buffer::{Buffer, Gap, Sample, StreamKind};
pub use config::{ElementConfig, SplitMuxConfig};
pub use context::StreamId;
pub use element::{ElementRegistry, Muxer, MuxerFactory, Writer, WriterFactory};
pub use elements::{FileWriter, MemoryFragment, MemoryStore, MemoryWriter, RawMuxer, WriterOp};
pub use error::{ElementError, FlowError, FlowResult, SplitMuxError};
pub use events::{FragmentInfo, SplitMuxEvent};
pub use location::{FormatLocationFn, format_location};
pub use segment::Segment;
pub use sink::{SplitMuxSink, SplitMuxSinkBuilder, StreamHandle};
pub use time::ClockTime;
pub use timecode::{TimeCodeError, TimeCodeInterval, VideoTimeCode};
