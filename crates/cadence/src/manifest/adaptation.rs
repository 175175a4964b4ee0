use std::sync::Arc;

use super::parsed::ParsedAdaptation;
use super::representation::Representation;
use super::{CodecSupport, MediaType};
use crate::error::EngineError;

/// ISO 639-1 codes and their ISO 639-3 counterparts.
const LANGUAGE_CODES: &[(&str, &str)] = &[
    ("ar", "ara"),
    ("de", "deu"),
    ("en", "eng"),
    ("es", "spa"),
    ("fr", "fra"),
    ("hi", "hin"),
    ("it", "ita"),
    ("ja", "jpn"),
    ("ko", "kor"),
    ("nl", "nld"),
    ("pl", "pol"),
    ("pt", "por"),
    ("ru", "rus"),
    ("sv", "swe"),
    ("tr", "tur"),
    ("zh", "zho"),
];

/// Bibliographic ISO 639-2 codes that differ from the terminological ones.
const BIBLIOGRAPHIC_CODES: &[(&str, &str)] = &[
    ("chi", "zho"),
    ("dut", "nld"),
    ("fre", "fra"),
    ("ger", "deu"),
];

/// Normalizes a language tag to a lowercase three-letter code where one is known.
pub fn normalize_language(language: &str) -> String {
    let primary = language
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let table = match primary.len() {
        2 => LANGUAGE_CODES,
        3 => BIBLIOGRAPHIC_CODES,
        _ => return primary,
    };
    table
        .iter()
        .find(|(from, _)| *from == primary)
        .map(|(_, to)| (*to).to_string())
        .unwrap_or(primary)
}

/// A track: a set of interchangeable representations of one media type.
#[derive(Debug, Clone, PartialEq)]
pub struct Adaptation {
    id: String,
    media_type: MediaType,
    language: Option<String>,
    normalized_language: Option<String>,
    closed_caption: bool,
    audio_description: bool,
    manually_added: bool,
    /// Sorted ascending by bitrate.
    representations: Vec<Arc<Representation>>,
}

impl Adaptation {
    /// Builds an adaptation keeping only the representations `codecs` can decode.
    ///
    /// Returns `Ok(None)` for an adaptation without any representation and
    /// [`EngineError::IncompatibleAdaptation`] when every representation was filtered out.
    pub(crate) fn from_parsed(
        parsed: ParsedAdaptation,
        period_id: &str,
        codecs: &dyn CodecSupport,
    ) -> Result<Option<Self>, EngineError> {
        if parsed.representations.is_empty() {
            return Ok(None);
        }

        let mut representations: Vec<Arc<Representation>> = parsed
            .representations
            .into_iter()
            .filter(|r| codecs.is_supported(&r.mime_type, &r.codec))
            .map(|r| Arc::new(Representation::from_parsed(r)))
            .collect();

        if representations.is_empty() {
            return Err(EngineError::IncompatibleAdaptation {
                period_id: period_id.to_string(),
                adaptation_id: parsed.id,
            });
        }
        representations.sort_by_key(|r| r.bitrate());

        let normalized_language = parsed.language.as_deref().map(normalize_language);
        Ok(Some(Self {
            id: parsed.id,
            media_type: parsed.media_type,
            language: parsed.language,
            normalized_language,
            closed_caption: parsed.closed_caption,
            audio_description: parsed.audio_description,
            manually_added: parsed.manually_added,
            representations,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn normalized_language(&self) -> Option<&str> {
        self.normalized_language.as_deref()
    }

    pub fn is_closed_caption(&self) -> bool {
        self.closed_caption
    }

    pub fn is_audio_description(&self) -> bool {
        self.audio_description
    }

    pub fn is_manually_added(&self) -> bool {
        self.manually_added
    }

    pub fn representations(&self) -> &[Arc<Representation>] {
        &self.representations
    }

    pub fn representation(&self, id: &str) -> Option<&Arc<Representation>> {
        self.representations.iter().find(|r| r.id() == id)
    }

    /// Bitrates of the playable representations, ascending.
    pub fn available_bitrates(&self) -> Vec<u64> {
        self.representations.iter().map(|r| r.bitrate()).collect()
    }

    /// Rebuilds this adaptation from a refreshed one, merging the segment
    /// indexes of representations present in both.
    pub(crate) fn merged_with(&self, newer: &Adaptation) -> Adaptation {
        let representations = newer
            .representations
            .iter()
            .map(|fresh| match self.representation(fresh.id()) {
                Some(old) if old == fresh => Arc::clone(old),
                Some(old) => Arc::new(old.merged_with(fresh)),
                None => Arc::clone(fresh),
            })
            .collect();
        Adaptation {
            representations,
            ..newer.clone()
        }
    }
}
