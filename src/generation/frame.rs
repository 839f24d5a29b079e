use serde::Deserialize;

use crate::error::{LensError, Result};

const BOUNDARY: &[u8] = b"\n\n";
const DATA_PREFIX: &str = "data:";

/// Largest unterminated fragment a reader should let a [`FrameBuffer`] hold
/// before treating the stream as broken.
pub const MAX_PENDING_BYTES: usize = 1 << 20;

/// Reassembles `\n\n`-delimited frames from arbitrarily cut chunks.
///
/// Works on bytes so that neither a frame nor a multi-byte character split
/// across two reads is lost; only complete frames are decoded to text.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and drains every frame it completes. The trailing
    /// fragment stays buffered for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // CR only ever appears as part of a line ending; JSON escapes it inside strings.
        self.pending
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = find(&self.pending[start..], BOUNDARY) {
            // Blank lines between events leave a newline at the front.
            let frame = trim_leading_newlines(&self.pending[start..start + offset]);
            if !frame.is_empty() {
                frames.push(String::from_utf8_lossy(frame).into_owned());
            }
            start += offset + BOUNDARY.len();
        }
        self.pending.drain(..start);
        frames
    }

    /// Takes whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = String::from_utf8_lossy(&rest);
        let trimmed = rest.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn trim_leading_newlines(frame: &[u8]) -> &[u8] {
    let start = frame
        .iter()
        .position(|byte| *byte != b'\n')
        .unwrap_or(frame.len());
    &frame[start..]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Cumulative text so far, with the token that was just produced.
    Text { text: String, token: Option<String> },
    Done { final_text: String },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    final_text: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// Decodes one frame. `Ok(None)` means the frame carries nothing to apply:
/// no `data:` prefix, an unknown event shape, or an empty text update.
pub fn decode_frame(frame: &str) -> Result<Option<StreamEvent>> {
    let Some(payload) = frame.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    let raw: RawEvent = serde_json::from_str(payload.trim())
        .map_err(|e| LensError::FrameDecode(format!("{e}: {payload}")))?;

    if raw.event.as_deref() == Some("done") {
        let final_text = raw
            .final_text
            .ok_or_else(|| LensError::FrameDecode("done event without final_text".into()))?;
        return Ok(Some(StreamEvent::Done { final_text }));
    }

    Ok(raw
        .text
        .filter(|text| !text.is_empty())
        .map(|text| StreamEvent::Text {
            text,
            token: raw.token.filter(|token| !token.is_empty()),
        }))
}
