// BlockFetch - Resumable block-parallel HTTP downloader
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! HTTP range requests
//!
//! # Requests made by the engine
//! 1. Probe: plain `GET`, only the advertised Content-Length is read
//! 2. Probe: `Range: bytes=<len-10>-<len-1>`, answered with 206 when the
//!    server honours ranges
//! 3. Worker: `Range: bytes=<start>-<end>` per block, 206 required
//! 4. Fallback: plain `GET` for the whole resource, 200 or 206 accepted
//!
//! All requests are blocking and run on the engine's own threads. Requests
//! 1 to 3 carry the configured request timeout; the fallback transfer has no
//! total limit and relies on TCP keepalive to notice a dead peer.

use crate::config::{DownloadConfig, RetryPolicy};
use crate::error::{FetchError, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::trace;

/// Size of the tail range used to detect range support
pub const PROBE_TAIL_BYTES: u64 = 10;

/// Read buffer of a block worker
pub const BLOCK_BUFFER_SIZE: usize = 64 * 1024;

/// Read buffer of the fallback worker
pub const FALLBACK_BUFFER_SIZE: usize = 512;

/// Blocking HTTP client for range downloads
#[derive(Debug, Clone)]
pub struct RangeClient {
    client: Client,
    request_timeout: Option<Duration>,
}

impl RangeClient {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        // the blocking client defaults to a 30 s total timeout; bounded
        // requests set their own
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(None)
            .tcp_keepalive(config.keepalive())
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            request_timeout: config.request_timeout(),
        })
    }

    /// `GET` carrying the request timeout, if any
    fn bounded_get(&self, url: &str) -> RequestBuilder {
        let request = self.client.get(url);
        match self.request_timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Advertised length of the resource
    ///
    /// Returns `None` when the server sends no Content-Length or a zero one.
    /// The body is never read.
    pub fn content_length(&self, url: &str) -> Result<Option<u64>> {
        let response = self.bounded_get(url).send().map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(unexpected_status(&response, url));
        }

        let length = response.content_length().filter(|len| *len > 0);
        trace!(url, ?length, "content length probed");
        Ok(length)
    }

    /// Ask for the last bytes of the resource and report whether the server
    /// answered with partial content
    pub fn supports_ranges(&self, url: &str, length: u64) -> Result<bool> {
        if length == 0 {
            return Ok(false);
        }
        let start = length.saturating_sub(PROBE_TAIL_BYTES);
        let response = self
            .bounded_get(url)
            .header(RANGE, format!("bytes={}-{}", start, length - 1))
            .send()
            .map_err(transport_error)?;

        trace!(url, status = %response.status(), "range support probed");
        Ok(response.status() == StatusCode::PARTIAL_CONTENT)
    }

    /// Request the inclusive range `[start, end]`; anything but 206 fails
    pub fn fetch_range(&self, url: &str, start: u64, end: u64) -> Result<Response> {
        let response = self
            .bounded_get(url)
            .header(RANGE, format!("bytes={}-{}", start, end))
            .send()
            .map_err(transport_error)?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(unexpected_status(&response, url));
        }
        Ok(response)
    }

    /// Request the whole resource without a total timeout; 200 and 206 are
    /// both accepted
    pub fn fetch_all(&self, url: &str) -> Result<Response> {
        let response = self.client.get(url).send().map_err(transport_error)?;
        match response.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(response),
            _ => Err(unexpected_status(&response, url)),
        }
    }
}

/// Shared by every mission of one manager
#[derive(Debug)]
pub struct DownloadContext {
    client: RangeClient,
    retry: RetryPolicy,
}

impl DownloadContext {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        Ok(Self {
            client: RangeClient::new(config)?,
            retry: config.retry.clone(),
        })
    }

    pub fn client(&self) -> &RangeClient {
        &self.client
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

fn transport_error(e: reqwest::Error) -> FetchError {
    FetchError::network_error(format!("Request failed: {}", e), !e.is_builder())
}

fn unexpected_status(response: &Response, url: &str) -> FetchError {
    FetchError::UnexpectedStatusCode {
        status_code: response.status().as_u16(),
        url: url.to_string(),
    }
}

/// Copy `reader` into `writer` one buffer at a time
///
/// `on_chunk` sees the size of every chunk after it has been written and
/// returns false to stop early. Returns true when the reader hit EOF.
pub(crate) fn copy_stream<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    mut on_chunk: F,
) -> std::io::Result<bool>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    F: FnMut(usize) -> bool,
{
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => return Ok(true),
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        writer.write_all(&buffer[..read])?;
        if !on_chunk(read) {
            writer.flush()?;
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_copy_stream_reads_to_end() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = Cursor::new(data.clone());
        let mut out = Vec::new();
        let mut chunks = Vec::new();

        let complete = copy_stream(&mut reader, &mut out, 300, |n| {
            chunks.push(n);
            true
        })
        .unwrap();

        assert!(complete);
        assert_eq!(out, data);
        assert_eq!(chunks, vec![300, 300, 300, 100]);
    }

    #[test]
    fn test_copy_stream_stops_after_current_buffer() {
        let mut reader = Cursor::new(vec![7u8; 4096]);
        let mut out = Vec::new();
        let mut seen = 0;

        let complete = copy_stream(&mut reader, &mut out, 512, |n| {
            seen += n;
            seen < 1024
        })
        .unwrap();

        assert!(!complete);
        assert_eq!(out.len(), 1024);
    }

    #[test]
    fn test_client_builds_from_default_config() {
        let context = DownloadContext::new(&DownloadConfig::default()).unwrap();
        assert_eq!(context.retry_policy(), &RetryPolicy::default());
        assert_eq!(context.client().request_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_request_timeout_can_be_disabled() {
        let config = DownloadConfig {
            request_timeout_secs: None,
            keepalive_secs: None,
            ..Default::default()
        };
        let client = RangeClient::new(&config).unwrap();
        assert_eq!(client.request_timeout(), None);
    }
}
