//! Track metadata backfill from probed tags

use onair_core::models::Track;

use crate::probe::TagMap;

pub const TITLE_KEYS: &[&str] = &["title", "tit2"];
pub const ARTIST_KEYS: &[&str] = &["artist", "tpe1", "album_artist", "tpe2"];
pub const ALBUM_KEYS: &[&str] = &["album", "talb"];
pub const GENRE_KEYS: &[&str] = &["genre", "tcon"];
pub const YEAR_KEYS: &[&str] = &["date", "year", "tdrc", "tyer"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    Title,
    Artist,
    Album,
    Genre,
    Year,
}

/// Fill empty descriptive fields of `track` from `tags`.
///
/// A field is only written when it is currently empty and a probed value exists;
/// caller-supplied or previously enriched values are never replaced. Returns the
/// fields that changed.
pub fn backfill(track: &mut Track, tags: &TagMap) -> Vec<MetadataField> {
    let mut changed = Vec::new();

    let text_fields: [(&mut String, &[&str], MetadataField); 4] = [
        (&mut track.title, TITLE_KEYS, MetadataField::Title),
        (&mut track.artist, ARTIST_KEYS, MetadataField::Artist),
        (&mut track.album, ALBUM_KEYS, MetadataField::Album),
        (&mut track.genre, GENRE_KEYS, MetadataField::Genre),
    ];
    for (slot, keys, field) in text_fields {
        if !slot.trim().is_empty() {
            continue;
        }
        if let Some(value) = tags.first_of(keys) {
            *slot = value.to_string();
            changed.push(field);
        }
    }

    if track.year.is_none() {
        if let Some(year) = tags.year_of(YEAR_KEYS) {
            track.year = Some(year);
            changed.push(MetadataField::Year);
        }
    }

    changed
}
