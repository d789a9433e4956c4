//! Filtering and SSE framing of streamed model output.
//!
//! Each fragment is classified on its own: a fragment whose trimmed content is
//! a complete `{...}` or `[...]` literal is raw tool data and is dropped, and
//! everything else is forwarded untouched and in order. There is no
//! cross-fragment buffering, so a payload split over two fragments passes
//! through.

use futures::{future, Stream, StreamExt, TryStream, TryStreamExt};
use std::convert::Infallible;
use std::fmt::Display;

/// Terminal frame sent once the upstream completes.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    AssistantText,
    ToolStructured,
}

pub fn classify_fragment(fragment: &str) -> TokenKind {
    let trimmed = fragment.trim();
    let bracketed = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));

    if bracketed {
        TokenKind::ToolStructured
    } else {
        TokenKind::AssistantText
    }
}

/// Drop tool-structured fragments, keeping assistant text and errors in order.
pub fn filter_fragments<S>(upstream: S) -> impl Stream<Item = Result<S::Ok, S::Error>>
where
    S: TryStream,
    S::Ok: AsRef<str>,
{
    upstream.into_stream().try_filter(|fragment| {
        let keep = classify_fragment(fragment.as_ref()) == TokenKind::AssistantText;
        if !keep {
            tracing::debug!(
                len = fragment.as_ref().len(),
                "Suppressed structured fragment"
            );
            metrics::counter!("stream_fragments_suppressed_total").increment(1);
        }
        future::ready(keep)
    })
}

/// Frame one fragment as an SSE `data` event.
///
/// A fragment spanning several lines becomes one `data:` line per line, which
/// SSE clients join back with `\n`. CRLF and lone CR count as line breaks, as
/// they do for SSE parsers.
pub fn data_frame(fragment: &str) -> String {
    let normalized = fragment.replace("\r\n", "\n").replace('\r', "\n");
    let mut frame = String::with_capacity(normalized.len() + 8);
    for line in normalized.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

/// Frame an upstream failure. Sent instead of [`DONE_FRAME`].
pub fn error_frame(message: &str) -> String {
    let single_line = message.replace(['\r', '\n'], " ");
    format!("event: error\ndata: {}\n\n", single_line)
}

/// Turn a fragment stream into SSE frames.
///
/// Emits one data frame per fragment, then [`DONE_FRAME`]. If the upstream
/// fails, an error frame is emitted and the stream ends without the done
/// marker.
pub fn sse_frames<S, E>(fragments: S) -> impl Stream<Item = Result<String, Infallible>>
where
    S: Stream<Item = Result<String, E>>,
    E: Display,
{
    async_stream::stream! {
        let mut fragments = std::pin::pin!(fragments);
        let mut forwarded = 0usize;

        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) => {
                    forwarded += 1;
                    yield Ok::<String, Infallible>(data_frame(&fragment));
                }
                Err(e) => {
                    tracing::warn!(error = %e, forwarded, "Model stream failed mid-response");
                    yield Ok(error_frame(&e.to_string()));
                    return;
                }
            }
        }

        tracing::debug!(forwarded, "Model stream completed");
        yield Ok(DONE_FRAME.to_string());
    }
}
