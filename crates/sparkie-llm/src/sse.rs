use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use crate::chat::TextStream;
use crate::error::UpstreamError;

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

enum SseLine {
    Skip,
    Done,
    Text(String),
    Invalid(String),
}

fn decode_line(raw: &[u8]) -> SseLine {
    let Ok(line) = std::str::from_utf8(raw) else {
        return SseLine::Invalid("event stream line is not valid UTF-8".into());
    };
    let line = line.trim();

    let Some(data) = line.strip_prefix("data:") else {
        // Blank separators, comments and `event:`/`id:` fields carry no text
        return SseLine::Skip;
    };
    let data = data.trim_start();

    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .filter(|text| !text.is_empty())
            .map_or(SseLine::Skip, SseLine::Text),
        Err(e) => SseLine::Invalid(format!("failed to parse stream chunk: {}", e)),
    }
}

/// Turn a chat-completions `text/event-stream` body into a stream of
/// content fragments. Lines split across network chunks are reassembled.
pub(crate) fn parse_sse_stream<S>(body: S) -> TextStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        let mut buffer: Vec<u8> = Vec::with_capacity(8192);

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);

                    while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
                        match decode_line(&line) {
                            SseLine::Skip => {}
                            SseLine::Done => return,
                            SseLine::Text(text) => yield Ok(text),
                            SseLine::Invalid(reason) => {
                                yield Err(UpstreamError::Decode(reason));
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(UpstreamError::Transport(e));
                    return;
                }
            }
        }

        // Body ended without a trailing newline
        match decode_line(&buffer) {
            SseLine::Text(text) => yield Ok(text),
            SseLine::Invalid(reason) => yield Err(UpstreamError::Decode(reason)),
            SseLine::Skip | SseLine::Done => {}
        }
    })
}
