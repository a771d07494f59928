use bytes::{Bytes, BytesMut};
use serde::Deserialize;

const TRACKER_MAX_BUFFER_BYTES: usize = 512 * 1024;
const TRACKER_TAIL_BYTES: usize = 128 * 1024;

/// Token counts reported by an OpenAI-style `usage` object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObservedUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl ObservedUsage {
    pub fn input_units(&self) -> u64 {
        self.input_tokens.unwrap_or(0)
    }

    pub fn output_units(&self) -> u64 {
        self.output_tokens.unwrap_or_else(|| {
            self.total_tokens
                .unwrap_or(0)
                .saturating_sub(self.input_tokens.unwrap_or(0))
        })
    }
}

#[derive(Deserialize)]
struct UsageEnvelope {
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct UsagePayload {
    #[serde(default)]
    total_tokens: Option<u64>,
    #[serde(default, alias = "prompt_tokens")]
    input_tokens: Option<u64>,
    #[serde(default, alias = "completion_tokens")]
    output_tokens: Option<u64>,
}

pub fn extract_usage_from_slice(bytes: &[u8]) -> Option<ObservedUsage> {
    let usage = serde_json::from_slice::<UsageEnvelope>(bytes).ok()?.usage?;
    Some(ObservedUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
    })
}

/// Watches a passthrough SSE body for the last `usage` object and the `[DONE]` marker
/// without holding more than a bounded tail of the stream.
#[derive(Debug, Default)]
pub struct SseUsageTracker {
    buffer: BytesMut,
    observed_usage: Option<ObservedUsage>,
    saw_done: bool,
}

impl SseUsageTracker {
    pub fn ingest(&mut self, chunk: &Bytes) {
        self.buffer.extend_from_slice(chunk.as_ref());

        while let Some((pos, delimiter_len)) = find_sse_delimiter(self.buffer.as_ref()) {
            let event_bytes = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);

            let Some(data) = extract_sse_data(event_bytes.as_ref()) else {
                continue;
            };
            let trimmed = trim_ascii_whitespace(&data);
            if trimmed == b"[DONE]" {
                self.saw_done = true;
                continue;
            }
            if trimmed.starts_with(b"{") {
                if let Some(usage) = extract_usage_from_slice(trimmed) {
                    self.observed_usage = Some(usage);
                }
            }
        }

        if self.buffer.len() > TRACKER_MAX_BUFFER_BYTES {
            let keep_from = self.buffer.len().saturating_sub(TRACKER_TAIL_BYTES);
            self.buffer = self.buffer.split_off(keep_from);
        }
    }

    pub fn observed_usage(&self) -> Option<ObservedUsage> {
        self.observed_usage
    }

    /// Whether the terminal `data: [DONE]` event has been seen.
    pub fn saw_done(&self) -> bool {
        self.saw_done
    }
}

fn find_sse_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.len() < 2 {
        return None;
    }

    // Single forward scan so mixed newline styles split at the earliest boundary.
    let mut idx = 0usize;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len()
            && buf[idx] == b'\r'
            && buf[idx + 1] == b'\n'
            && buf[idx + 2] == b'\r'
            && buf[idx + 3] == b'\n'
        {
            return Some((idx, 4));
        }
        idx += 1;
    }

    None
}

fn extract_sse_data(event: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::<u8>::new();
    for line in event.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(rest) = line.strip_prefix(b"data:") else {
            continue;
        };
        let rest = trim_ascii_whitespace(rest);
        if rest.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(b'\n');
        }
        out.extend_from_slice(rest);
    }
    (!out.is_empty()).then_some(out)
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|pos| pos + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_keeps_last_usage_across_split_chunks() {
        let mut tracker = SseUsageTracker::default();
        tracker.ingest(&Bytes::from_static(b"data: {\"choices\":[]}\n\ndata: {\"usage\":{\"prompt_"));
        assert!(tracker.observed_usage().is_none());
        tracker.ingest(&Bytes::from_static(
            b"tokens\":7,\"completion_tokens\":3}}\r\n\r\ndata: [DONE]\n\n",
        ));
        let usage = tracker.observed_usage().expect("usage");
        assert_eq!(usage.input_units(), 7);
        assert_eq!(usage.output_units(), 3);
        assert!(tracker.saw_done());
    }

    #[test]
    fn output_units_fall_back_to_total_minus_input() {
        let usage =
            extract_usage_from_slice(br#"{"usage":{"prompt_tokens":4,"total_tokens":10}}"#)
                .expect("usage");
        assert_eq!(usage.output_units(), 6);
        assert!(extract_usage_from_slice(br#"{"id":"x"}"#).is_none());
    }
}
