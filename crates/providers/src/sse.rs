//! SSE decoding shared by the streaming adapters.
//!
//! - [`drain_events`] pulls complete event payloads out of a text buffer.
//! - [`sse_response_stream`] turns a `reqwest::Response` plus a
//!   provider-specific parser into a [`BoxStream`] of [`StreamEvent`]s.

use crate::util::from_reqwest;
use na_domain::error::Result;
use na_domain::stream::{BoxStream, StreamEvent};

/// Extract the `data:` payload of every complete event in `buffer`.
///
/// Events are delimited by a blank line. Multiple `data:` lines in one event
/// are joined with `\n`. `event:`, `id:`, `retry:` and comment lines are
/// ignored. Consumed text is removed; a trailing partial event stays put.
pub(crate) fn drain_events(buffer: &mut String) -> Vec<String> {
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }

    let mut payloads = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos + 2).collect();

        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data.push(rest.trim());
            }
        }
        let joined = data.join("\n");
        if !joined.trim().is_empty() {
            payloads.push(joined);
        }
    }
    payloads
}

/// Split off the longest valid UTF-8 prefix of `pending`, leaving an
/// incomplete trailing code point for the next chunk.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        // Genuinely invalid bytes: decode lossily rather than stall.
        Err(_) => pending.len(),
    };
    let rest = pending.split_off(valid);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}

/// Build a [`BoxStream`] from an SSE response and a parser closure.
///
/// The closure is `FnMut` so adapters can keep tool-call assembly state
/// across payloads. A fallback `Done` is emitted if the parser never
/// produced one before the body closed.
pub(crate) fn sse_response_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut pending: Vec<u8> = Vec::new();
        let mut buffer = String::new();
        let mut done_emitted = false;

        loop {
            let finished = match response.chunk().await {
                Ok(Some(bytes)) => {
                    pending.extend_from_slice(&bytes);
                    buffer.push_str(&take_utf8(&mut pending));
                    false
                }
                Ok(None) => {
                    if !pending.is_empty() {
                        buffer.push_str(&String::from_utf8_lossy(&pending));
                        pending.clear();
                    }
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                    }
                    true
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    return;
                }
            };

            for data in drain_events(&mut buffer) {
                for event in parse_data(&data) {
                    if matches!(&event, Ok(StreamEvent::Done { .. })) {
                        done_emitted = true;
                    }
                    yield event;
                }
            }

            if finished {
                break;
            }
        }

        if !done_emitted {
            yield Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            });
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_multiple_events() {
        let mut buf = String::from("event: message\ndata: first\n\ndata: second\n\n");
        assert_eq!(drain_events(&mut buf), vec!["first", "second"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_event_stays_in_buffer() {
        let mut buf = String::from("data: complete\n\ndata: partial");
        assert_eq!(drain_events(&mut buf), vec!["complete"]);
        assert_eq!(buf, "data: partial");

        buf.push_str("\n\n");
        assert_eq!(drain_events(&mut buf), vec!["partial"]);
    }

    #[test]
    fn crlf_delimiters_are_accepted() {
        let mut buf = String::from("data: {\"a\":1}\r\n\r\n");
        assert_eq!(drain_events(&mut buf), vec!["{\"a\":1}"]);
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut buf = String::from("data: line one\ndata: line two\n\n");
        assert_eq!(drain_events(&mut buf), vec!["line one\nline two"]);
    }

    #[test]
    fn non_data_lines_and_empty_payloads_are_skipped() {
        let mut buf = String::from(": keepalive\nevent: ping\nid: 42\n\ndata: \n\ndata: [DONE]\n\n");
        assert_eq!(drain_events(&mut buf), vec!["[DONE]"]);
    }

    #[test]
    fn split_code_point_waits_for_next_chunk() {
        let snowman = "☃".as_bytes();
        let mut pending = vec![b'a', snowman[0], snowman[1]];
        assert_eq!(take_utf8(&mut pending), "a");
        assert_eq!(pending.len(), 2);
        pending.push(snowman[2]);
        assert_eq!(take_utf8(&mut pending), "☃");
        assert!(pending.is_empty());
    }
}
