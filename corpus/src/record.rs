use serde::{Deserialize, Serialize};

/// Explicit end-of-sequence marker appended by the upstream cleaning
/// pipeline to every prompt and response. Never implicit truncation.
pub const EOS_MARKER: &str = "[EOS]";

/// A single prompt/response training example.
///
/// Invariant: both fields end with [`EOS_MARKER`]. The upstream pipeline
/// guarantees it; [`Record::is_terminated`] is the defensive check applied
/// when decoding a shard line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub prompt: String,
    pub response: String,
}

impl Record {
    pub fn new(prompt: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            response: response.into(),
        }
    }

    /// Whether both fields carry the explicit end marker.
    pub fn is_terminated(&self) -> bool {
        self.prompt.ends_with(EOS_MARKER) && self.response.ends_with(EOS_MARKER)
    }

    /// Combined encoded sequence length of this record, marker excluded,
    /// one end-of-sequence id per field included.
    pub fn seq_len(&self) -> usize {
        field_content(&self.prompt).len() + field_content(&self.response).len() + 2
    }
}

/// Field text with the end marker stripped.
pub(crate) fn field_content(field: &str) -> &str {
    field.strip_suffix(EOS_MARKER).unwrap_or(field)
}
