use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::element::{Writer, WriterFactory};
use crate::error::ElementError;

/// Lifecycle step recorded by a [`MemoryWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterOp {
    Started { location: Option<PathBuf> },
    Finished,
    Stopped,
}

/// One fragment written to memory.
#[derive(Debug, Clone)]
pub struct MemoryFragment {
    /// Id of the writer instance that produced it
    pub writer_id: u32,
    pub location: Option<PathBuf>,
    pub data: Bytes,
    pub finished: bool,
}

#[derive(Debug, Default)]
struct StoreInner {
    next_writer_id: u32,
    fragments: Vec<MemoryFragment>,
    journal: Vec<(u32, WriterOp)>,
    fail_after_bytes: Option<u64>,
}

/// Shared storage behind every [`MemoryWriter`] created from it.
///
/// Keeps the fragments and a global, ordered journal of writer lifecycle
/// steps so the ordering between writers can be inspected.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writer(&self) -> MemoryWriter {
        let mut inner = self.inner.lock();
        let id = inner.next_writer_id;
        inner.next_writer_id += 1;
        MemoryWriter {
            id,
            store: self.clone(),
            location: None,
            current: None,
            written: 0,
        }
    }

    /// A factory creating writers backed by this store.
    pub fn factory(&self) -> impl WriterFactory + 'static {
        let store = self.clone();
        move || -> Result<Box<dyn Writer>, ElementError> { Ok(Box::new(store.writer())) }
    }

    /// Makes writes fail once a writer has written more than `bytes` bytes.
    pub fn fail_after(&self, bytes: u64) {
        self.inner.lock().fail_after_bytes = Some(bytes);
    }

    pub fn fragments(&self) -> Vec<MemoryFragment> {
        self.inner.lock().fragments.clone()
    }

    pub fn journal(&self) -> Vec<(u32, WriterOp)> {
        self.inner.lock().journal.clone()
    }

    fn record(&self, writer_id: u32, op: WriterOp) {
        self.inner.lock().journal.push((writer_id, op));
    }
}

/// A writer that keeps fragments in a [`MemoryStore`].
pub struct MemoryWriter {
    id: u32,
    store: MemoryStore,
    location: Option<PathBuf>,
    current: Option<BytesMut>,
    written: u64,
}

impl MemoryWriter {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Writer for MemoryWriter {
    fn set_location(&mut self, location: &Path) -> Result<(), ElementError> {
        self.location = Some(location.to_path_buf());
        Ok(())
    }

    fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    fn start(&mut self) -> Result<(), ElementError> {
        self.current = Some(BytesMut::new());
        self.written = 0;
        self.store.record(
            self.id,
            WriterOp::Started {
                location: self.location.clone(),
            },
        );
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ElementError> {
        let limit = self.store.inner.lock().fail_after_bytes;
        let current = self.current.as_mut().ok_or(ElementError::NotRunning)?;
        if let Some(limit) = limit
            && self.written + data.len() as u64 > limit
        {
            return Err(ElementError::Io(std::io::Error::other("storage full")));
        }
        current.extend_from_slice(data);
        self.written += data.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ElementError> {
        let Some(data) = self.current.take() else {
            return Ok(());
        };
        let mut inner = self.store.inner.lock();
        inner.fragments.push(MemoryFragment {
            writer_id: self.id,
            location: self.location.clone(),
            data: data.freeze(),
            finished: true,
        });
        inner.journal.push((self.id, WriterOp::Finished));
        Ok(())
    }

    fn stop(&mut self) {
        let mut inner = self.store.inner.lock();
        if let Some(data) = self.current.take() {
            inner.fragments.push(MemoryFragment {
                writer_id: self.id,
                location: self.location.clone(),
                data: data.freeze(),
                finished: false,
            });
        }
        inner.journal.push((self.id, WriterOp::Stopped));
    }
}
