use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::sync::Mutex;

use crate::adapter::{EventSource, FrameStream, RawFrame};
use crate::error::{IngestError, Result};

/// `EventSource` over a newline-delimited HTTP streaming response
/// (`GET <source_url>`, `Transfer-Encoding: chunked`, one JSON frame per
/// line). This is the one concrete, production-capable source shipped in
/// this repository; any upstream transport can implement `EventSource`
/// instead.
pub struct HttpEventSource {
    client: reqwest::Client,
    url: String,
}

impl HttpEventSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn connect(&self) -> Result<Box<dyn FrameStream>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| IngestError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(IngestError::Transport(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        Ok(Box::new(NdjsonStream {
            response: Mutex::new(response),
            buf: BytesMut::new(),
        }))
    }
}

struct NdjsonStream {
    response: Mutex<reqwest::Response>,
    buf: BytesMut,
}

#[async_trait]
impl FrameStream for NdjsonStream {
    async fn next_frame(&mut self) -> Option<Result<RawFrame>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line = self.buf.split_to(pos);
                self.buf.advance(1);
                if line.is_empty() {
                    continue;
                }
                return Some(Ok(line.to_vec()));
            }

            let mut response = self.response.lock().await;
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    drop(response);
                    self.buf.extend_from_slice(&chunk);
                }
                Ok(None) => {
                    if self.buf.is_empty() {
                        return None;
                    }
                    let rest = std::mem::take(&mut self.buf);
                    return Some(Ok(rest.to_vec()));
                }
                Err(e) => return Some(Err(IngestError::Transport(e.to_string()))),
            }
        }
    }
}
