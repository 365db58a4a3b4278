//! ffprobe output parsing

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct FFprobeOutput {
    format: Option<FFprobeFormat>,
    streams: Option<Vec<FFprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FFprobeFormat {
    duration: Option<String>,
    tags: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct FFprobeStream {
    codec_type: Option<String>,
    tags: Option<HashMap<String, String>>,
}

/// Tag map with normalized keys: trimmed, lower-case, `-` folded to `_`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMap(HashMap<String, String>);

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize_key(key: &str) -> String {
        key.trim().to_lowercase().replace('-', "_")
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(Self::normalize_key(key), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&Self::normalize_key(key)).map(String::as_str)
    }

    /// First non-empty value among `keys`, in order.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.get(k))
            .map(str::trim)
            .find(|v| !v.is_empty())
    }

    /// First valid year among `keys`, in order.
    pub fn year_of(&self, keys: &[&str]) -> Option<i32> {
        keys.iter().filter_map(|k| self.get(k)).find_map(coerce_year)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for TagMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = TagMap::new();
        for (k, v) in iter {
            map.insert(k.as_ref(), v);
        }
        map
    }
}

/// Year from a date-like tag value: leading four digits, 1900..=2100.
///
/// `2023-05-12` and `2023` give 2023; `1999/01/01` gives 1999.
pub fn coerce_year(value: &str) -> Option<i32> {
    let kept: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    let head = kept.get(..4)?;
    if !head.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = head.parse().ok()?;
    (1900..=2100).contains(&year).then_some(year)
}

/// Duration and tags read from a probe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeResult {
    pub duration_seconds: f64,
    pub tags: TagMap,
}

impl ProbeResult {
    /// Parse `ffprobe -print_format json -show_format -show_streams` output.
    ///
    /// Container tags win; the first audio stream's tags are used only when the
    /// container has none.
    pub fn from_json(stdout: &[u8]) -> anyhow::Result<Self> {
        let output: FFprobeOutput = serde_json::from_slice(stdout)
            .map_err(|e| anyhow::anyhow!("Failed to parse ffprobe output: {}", e))?;

        let duration_seconds = output
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0)
            .unwrap_or(0.0);

        let mut tags: TagMap = output
            .format
            .and_then(|f| f.tags)
            .unwrap_or_default()
            .into_iter()
            .collect();

        if tags.is_empty() {
            let stream_tags = output
                .streams
                .unwrap_or_default()
                .into_iter()
                .find(|s| s.codec_type.as_deref() == Some("audio"))
                .and_then(|s| s.tags);
            if let Some(stream_tags) = stream_tags {
                tags = stream_tags.into_iter().collect();
            }
        }

        Ok(Self {
            duration_seconds,
            tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_and_separator_insensitive() {
        let mut tags = TagMap::new();
        tags.insert(" Album-Artist ", "Someone");
        assert_eq!(tags.get("album_artist"), Some("Someone"));
        assert_eq!(tags.get("ALBUM-ARTIST"), Some("Someone"));
    }

    #[test]
    fn first_of_skips_missing_and_blank() {
        let tags: TagMap = [("TPE1", "Lead"), ("artist", "  ")].into_iter().collect();
        assert_eq!(tags.first_of(&["artist", "tpe1"]), Some("Lead"));
        assert_eq!(tags.first_of(&["album"]), None);
    }

    #[test]
    fn year_coercion() {
        assert_eq!(coerce_year("2023-05-12"), Some(2023));
        assert_eq!(coerce_year("2023"), Some(2023));
        assert_eq!(coerce_year("1999/01/01"), Some(1999));
        assert_eq!(coerce_year("1850"), None);
        assert_eq!(coerce_year("2101"), None);
        assert_eq!(coerce_year("99"), None);
        assert_eq!(coerce_year("-2020"), None);
        assert_eq!(coerce_year(""), None);
    }

    #[test]
    fn year_of_takes_first_valid_key() {
        let tags: TagMap = [("date", "unknown"), ("TYER", "1987")].into_iter().collect();
        assert_eq!(tags.year_of(&["date", "year", "tdrc", "tyer"]), Some(1987));
    }

    #[test]
    fn container_tags_preferred() {
        let json = br#"{
            "format": {"duration": "183.42", "tags": {"TITLE": "Container", "Artist": "A"}},
            "streams": [{"codec_type": "audio", "tags": {"title": "Stream"}}]
        }"#;
        let probe = ProbeResult::from_json(json).unwrap();
        assert!((probe.duration_seconds - 183.42).abs() < 1e-9);
        assert_eq!(probe.tags.get("title"), Some("Container"));
        assert_eq!(probe.tags.get("artist"), Some("A"));
    }

    #[test]
    fn falls_back_to_first_audio_stream() {
        let json = br#"{
            "format": {"duration": "N/A"},
            "streams": [
                {"codec_type": "video", "tags": {"title": "Cover"}},
                {"codec_type": "audio", "tags": {"TIT2": "From stream"}},
                {"codec_type": "audio", "tags": {"title": "Second"}}
            ]
        }"#;
        let probe = ProbeResult::from_json(json).unwrap();
        assert_eq!(probe.duration_seconds, 0.0);
        assert_eq!(probe.tags.first_of(&["title", "tit2"]), Some("From stream"));
        assert_eq!(probe.tags.len(), 1);
    }

    #[test]
    fn empty_object_is_empty_probe() {
        let probe = ProbeResult::from_json(b"{}").unwrap();
        assert_eq!(probe, ProbeResult::default());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(ProbeResult::from_json(b"not json").is_err());
    }
}
