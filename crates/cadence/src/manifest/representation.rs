use super::parsed::ParsedRepresentation;
use super::segment_index::SegmentIndex;

/// A single quality variant of an adaptation. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    id: String,
    bitrate: u64,
    codec: String,
    mime_type: String,
    width: Option<u32>,
    height: Option<u32>,
    index: SegmentIndex,
}

impl Representation {
    pub(crate) fn from_parsed(parsed: ParsedRepresentation) -> Self {
        Self {
            id: parsed.id,
            bitrate: parsed.bitrate,
            codec: parsed.codec,
            mime_type: parsed.mime_type,
            width: parsed.width,
            height: parsed.height,
            index: SegmentIndex::from_parsed(parsed.index),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared bitrate in bits per second.
    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn width(&self) -> Option<u32> {
        self.width
    }

    pub fn height(&self) -> Option<u32> {
        self.height
    }

    pub fn index(&self) -> &SegmentIndex {
        &self.index
    }

    /// Same representation with its segment index merged with a refreshed one.
    pub(crate) fn merged_with(&self, newer: &Representation) -> Representation {
        Representation {
            index: self.index.merged_with(&newer.index),
            ..newer.clone()
        }
    }
}
