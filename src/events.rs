//! Server-Sent Events subscription for `/components/{id}/events`.

use crate::config::EVENT_RETRY_DELAY;
use crate::observers::Observers;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client as HttpClient, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Events pushed by the backend for one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentEvent {
    Message {
        event: String,
        data: String,
        id: Option<String>,
    },
    /// The server refused the stream; no reconnect will follow.
    Closed { status: u16 },
}

/// Handle of a running event stream. Closing (or dropping) it stops the
/// reader task; reconnects happen inside the task until then.
pub struct EventSubscription {
    url: String,
    task: JoinHandle<()>,
}

impl EventSubscription {
    pub fn open(
        http: HttpClient,
        url: String,
        observers: Arc<Observers<ComponentEvent>>,
    ) -> Self {
        let task = tokio::spawn(read_loop(http, url.clone(), observers));
        Self { url, task }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    pub fn close(self) {
        debug!("closing event stream {}", self.url);
        self.task.abort();
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum StreamEnd {
    Eof,
    Refused(StatusCode),
}

async fn read_loop(http: HttpClient, url: String, observers: Arc<Observers<ComponentEvent>>) {
    let mut last_event_id: Option<String> = None;
    let mut retry = EVENT_RETRY_DELAY;

    loop {
        match stream_once(&http, &url, &observers, &mut last_event_id, &mut retry).await {
            Ok(StreamEnd::Eof) => debug!("event stream {url} ended, reconnecting"),
            Ok(StreamEnd::Refused(status)) => {
                warn!("event stream {url} refused with {status}, giving up");
                observers.emit(&ComponentEvent::Closed {
                    status: status.as_u16(),
                });
                return;
            }
            Err(e) => warn!("event stream {url} failed: {e}"),
        }
        tokio::time::sleep(retry).await;
    }
}

async fn stream_once(
    http: &HttpClient,
    url: &str,
    observers: &Observers<ComponentEvent>,
    last_event_id: &mut Option<String>,
    retry: &mut Duration,
) -> Result<StreamEnd, reqwest::Error> {
    let mut req = http
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache");
    if let Some(id) = last_event_id.as_deref() {
        req = req.header("Last-Event-ID", id);
    }

    let resp = req.send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Ok(StreamEnd::Refused(status));
    }

    let mut parser = SseParser::default();
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        for frame in parser.feed(&chunk?) {
            match frame {
                SseFrame::Retry(delay) => *retry = delay,
                SseFrame::Event { event, data, id } => {
                    if id.is_some() {
                        *last_event_id = id.clone();
                    }
                    observers.emit(&ComponentEvent::Message { event, data, id });
                }
            }
        }
    }
    Ok(StreamEnd::Eof)
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseFrame {
    Event {
        event: String,
        data: String,
        id: Option<String>,
    },
    Retry(Duration),
}

/// Incremental `text/event-stream` decoder.
#[derive(Default)]
pub(crate) struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    return Some(SseFrame::Retry(Duration::from_millis(ms)));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame::Event {
            event: event.unwrap_or_else(|| "message".into()),
            data,
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_events_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"event: state\nda").is_empty());
        let frames = parser.feed(b"ta: {\"state\":\"OK\"}\r\nid: 7\n\n");
        assert_eq!(
            frames,
            vec![SseFrame::Event {
                event: "state".into(),
                data: "{\"state\":\"OK\"}".into(),
                id: Some("7".into()),
            }]
        );
    }

    #[test]
    fn joins_multiline_data_and_defaults_event_name() {
        let mut parser = SseParser::default();
        let frames = parser.feed(b": keepalive comment\ndata: a\ndata: b\n\n");
        assert_eq!(
            frames,
            vec![SseFrame::Event {
                event: "message".into(),
                data: "a\nb".into(),
                id: None,
            }]
        );
    }

    #[test]
    fn retry_and_empty_events() {
        let mut parser = SseParser::default();
        let frames = parser.feed(b"retry: 500\n\nevent: ping\n\n");
        assert_eq!(frames, vec![SseFrame::Retry(Duration::from_millis(500))]);
    }
}
