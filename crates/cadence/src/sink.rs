// Buffer sinks: where fetched media ends up.
//
// Video and audio sinks must all exist before the first push, so they are
// created up front; text and image sinks are created the first time content
// of their type is pushed.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::bookkeeper::TimeRange;
use crate::error::EngineError;
use crate::manifest::MediaType;

pub trait BufferSink: Send {
    /// Appends media covering `range`. Initialization data is pushed with an empty range.
    fn push(&mut self, data: Bytes, range: TimeRange) -> Result<(), EngineError>;

    fn remove(&mut self, range: TimeRange) -> Result<(), EngineError>;

    /// Releases the sink. Already pushed data is left to the host.
    fn dispose(&mut self);
}

pub trait BufferSinkFactory: Send + Sync {
    /// `text_track_options` is only passed for text sinks.
    fn create(
        &self,
        media_type: MediaType,
        codec: &str,
        text_track_options: Option<&serde_json::Value>,
    ) -> Result<Box<dyn BufferSink>, EngineError>;
}

pub(crate) struct SinkSet {
    factory: Arc<dyn BufferSinkFactory>,
    text_track_options: Option<serde_json::Value>,
    sinks: BTreeMap<MediaType, Box<dyn BufferSink>>,
}

impl SinkSet {
    pub(crate) fn new(
        factory: Arc<dyn BufferSinkFactory>,
        text_track_options: Option<serde_json::Value>,
    ) -> Self {
        Self {
            factory,
            text_track_options,
            sinks: BTreeMap::new(),
        }
    }

    pub(crate) fn has(&self, media_type: MediaType) -> bool {
        self.sinks.contains_key(&media_type)
    }

    /// Creates the sink of `media_type` if it does not exist yet.
    pub(crate) fn ensure(&mut self, media_type: MediaType, codec: &str) -> Result<(), EngineError> {
        if self.has(media_type) {
            return Ok(());
        }
        let options = match media_type {
            MediaType::Text => self.text_track_options.as_ref(),
            _ => None,
        };
        let sink = self.factory.create(media_type, codec, options)?;
        debug!(%media_type, codec, "Created buffer sink");
        self.sinks.insert(media_type, sink);
        Ok(())
    }

    pub(crate) fn push(
        &mut self,
        media_type: MediaType,
        data: Bytes,
        range: TimeRange,
    ) -> Result<(), EngineError> {
        self.sinks
            .get_mut(&media_type)
            .ok_or_else(|| EngineError::buffer_sink(media_type, "sink does not exist"))?
            .push(data, range)
    }

    pub(crate) fn remove(&mut self, media_type: MediaType, range: TimeRange) {
        if let Some(sink) = self.sinks.get_mut(&media_type)
            && let Err(e) = sink.remove(range)
        {
            warn!(%media_type, start = range.start, end = range.end, error = %e, "Failed to remove buffered range");
        }
    }

    pub(crate) fn dispose_all(&mut self) {
        for (media_type, mut sink) in std::mem::take(&mut self.sinks) {
            sink.dispose();
            debug!(%media_type, "Disposed buffer sink");
        }
    }
}
