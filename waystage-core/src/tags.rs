//! Tag blob codec for the staging store.
//!
//! A blob is the concatenation of `key NUL value NUL` for every tag, UTF-8
//! encoded. An empty blob is an empty tag map.
use std::str;

use thiserror::Error;

use crate::Tags;

/// Tags dropped before staging unless the configuration overrides the list.
pub const DEFAULT_IGNORED_TAGS: [&str; 3] = ["created_by", "source", "converted_by"];

/// Errors raised when decoding a persisted tag blob.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagBlobError {
    /// A field was not valid UTF-8.
    #[error("tag blob field at byte {offset} is not valid UTF-8")]
    InvalidUtf8 {
        /// Byte offset of the offending field.
        offset: usize,
    },
    /// The blob ended in the middle of a key/value pair.
    #[error("tag blob has a key without a value")]
    DanglingKey,
    /// The final field was not NUL terminated.
    #[error("tag blob is not NUL terminated")]
    Unterminated,
}

/// Serialize tags into a NUL-delimited blob.
///
/// # Examples
/// ```
/// use waystage_core::{Tags, tags::{decode_tags, encode_tags}};
///
/// let tags = Tags::from([("highway".to_owned(), "residential".to_owned())]);
/// let blob = encode_tags(&tags);
/// assert_eq!(blob, b"highway\0residential\0");
/// assert_eq!(decode_tags(&blob).unwrap(), tags);
/// ```
pub fn encode_tags(tags: &Tags) -> Vec<u8> {
    let capacity = tags.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
    let mut blob = Vec::with_capacity(capacity);
    for (key, value) in tags {
        blob.extend_from_slice(key.as_bytes());
        blob.push(0);
        blob.extend_from_slice(value.as_bytes());
        blob.push(0);
    }
    blob
}

/// Decode a NUL-delimited blob back into tags.
pub fn decode_tags(blob: &[u8]) -> Result<Tags, TagBlobError> {
    let mut tags = Tags::new();
    if blob.is_empty() {
        return Ok(tags);
    }
    if blob.last() != Some(&0) {
        return Err(TagBlobError::Unterminated);
    }

    let mut pending_key: Option<String> = None;
    let mut offset = 0;
    for field in blob.split(|byte| *byte == 0) {
        let start = offset;
        offset += field.len() + 1;
        if start >= blob.len() {
            // Trailing empty slice after the final terminator.
            break;
        }
        let text = str::from_utf8(field)
            .map_err(|_| TagBlobError::InvalidUtf8 { offset: start })?
            .to_owned();
        match pending_key.take() {
            Some(key) => {
                tags.insert(key, text);
            }
            None => pending_key = Some(text),
        }
    }

    if pending_key.is_some() {
        return Err(TagBlobError::DanglingKey);
    }
    Ok(tags)
}

/// Remove ignore-listed keys in place.
pub fn strip_ignored<S: AsRef<str>>(tags: &mut Tags, ignored: &[S]) {
    for key in ignored {
        tags.remove(key.as_ref());
    }
}
