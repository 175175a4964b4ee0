// Parsed manifest documents as handed over by a `ManifestFetcher`.
//
// These are plain data: no validation happens here, `Manifest::from_parsed`
// enforces the model's invariants.

use serde::{Deserialize, Serialize};

use super::MediaType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedManifest {
    /// URL the document was fetched from; refreshes re-fetch it. Fetchers
    /// fill it in when the document omits it.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub is_dynamic: bool,
    /// Minimum delay between two refreshes, in seconds.
    #[serde(default)]
    pub minimum_update_period: Option<f64>,
    pub periods: Vec<ParsedPeriod>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedPeriod {
    pub id: String,
    pub start: f64,
    #[serde(default)]
    pub duration: Option<f64>,
    pub adaptations: Vec<ParsedAdaptation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedAdaptation {
    pub id: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub closed_caption: bool,
    #[serde(default)]
    pub audio_description: bool,
    #[serde(default)]
    pub manually_added: bool,
    pub representations: Vec<ParsedRepresentation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRepresentation {
    pub id: String,
    pub bitrate: u64,
    pub codec: String,
    pub mime_type: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    pub index: ParsedSegmentIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSegmentIndex {
    #[serde(default)]
    pub init: Option<ParsedSegment>,
    #[serde(default)]
    pub segments: Vec<ParsedSegment>,
    /// False for live indexes that may grow on refresh.
    #[serde(default = "default_finished")]
    pub is_finished: bool,
}

fn default_finished() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSegment {
    /// Start time in seconds.
    #[serde(default)]
    pub time: f64,
    /// Duration in seconds; zero for initialization segments.
    #[serde(default)]
    pub duration: f64,
    pub url: String,
    /// Inclusive byte range within `url`.
    #[serde(default)]
    pub byte_range: Option<(u64, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_document() {
        let doc: ParsedManifest = serde_json::from_value(serde_json::json!({
            "url": "https://cdn.example/vod.json",
            "periods": [{
                "id": "p0",
                "start": 0.0,
                "adaptations": [{
                    "id": "v",
                    "type": "video",
                    "representations": [{
                        "id": "v1",
                        "bitrate": 1_000_000,
                        "codec": "avc1.64001f",
                        "mime_type": "video/mp4",
                        "index": {
                            "init": { "url": "v1/init.mp4" },
                            "segments": [{ "time": 0.0, "duration": 4.0, "url": "v1/0.m4s" }]
                        }
                    }]
                }]
            }]
        }))
        .unwrap();

        assert!(!doc.is_dynamic);
        let index = &doc.periods[0].adaptations[0].representations[0].index;
        assert!(index.is_finished);
        assert_eq!(index.init.as_ref().map(|s| s.duration), Some(0.0));
        assert_eq!(doc.periods[0].adaptations[0].media_type, MediaType::Video);
    }
}
