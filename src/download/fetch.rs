//! Artifact fetching.
//!
//! Resolves a source reference (HTTP(S) URL or embedded `data:` URI) into
//! bytes, reporting continuous progress for streamed transfers.

use base64::Engine as _;
use base64::engine::general_purpose;
use std::time::Instant;
use url::Url;

use crate::error::{DownloadError, Error, Result};

/// Minimum interval between progress callbacks during a streamed transfer
const PROGRESS_EMIT_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

/// A parsed artifact source reference
pub(crate) enum SourceRef {
    /// Remote artifact to stream over HTTP(S)
    Url(Url),
    /// Bytes embedded in the reference itself
    Data(Vec<u8>),
}

/// Parse a source reference string.
pub(crate) fn parse_source(source: &str) -> Result<SourceRef> {
    if let Some(rest) = source.strip_prefix("data:") {
        let Some((meta, payload)) = rest.split_once(',') else {
            return Err(DownloadError::UnsupportedReference(source.to_string()).into());
        };
        if !meta.ends_with(";base64") {
            return Err(DownloadError::UnsupportedReference(
                "data URI without base64 encoding".to_string(),
            )
            .into());
        }
        let bytes = general_purpose::STANDARD.decode(payload).map_err(|e| {
            Error::Download(DownloadError::UnsupportedReference(format!(
                "invalid base64 payload: {}",
                e
            )))
        })?;
        return Ok(SourceRef::Data(bytes));
    }

    let url = Url::parse(source)
        .map_err(|_| Error::Download(DownloadError::UnsupportedReference(source.to_string())))?;
    match url.scheme() {
        "http" | "https" => Ok(SourceRef::Url(url)),
        scheme => Err(DownloadError::UnsupportedReference(format!(
            "unsupported scheme {}",
            scheme
        ))
        .into()),
    }
}

/// Fetch an artifact's bytes, invoking `on_progress(fraction, bytes_per_sec)`
/// as the transfer advances.
///
/// Embedded data URIs complete in one step. Streamed transfers report a
/// fraction of 0.0 when the server does not advertise a content length.
pub(crate) async fn fetch_artifact<F>(
    client: &reqwest::Client,
    source: &str,
    mut on_progress: F,
) -> Result<Vec<u8>>
where
    F: FnMut(f32, u64),
{
    match parse_source(source)? {
        SourceRef::Data(bytes) => {
            on_progress(1.0, 0);
            Ok(bytes)
        }
        SourceRef::Url(url) => {
            let mut response = client.get(url).send().await?;

            let status = response.status();
            if !status.is_success() {
                return Err(DownloadError::FetchFailed {
                    source: source.to_string(),
                    reason: format!("HTTP {}", status.as_u16()),
                }
                .into());
            }

            let total = response.content_length().unwrap_or(0);
            let mut bytes = Vec::with_capacity(total as usize);
            let start = Instant::now();
            let mut last_emit = Instant::now();

            while let Some(chunk) = response.chunk().await? {
                bytes.extend_from_slice(&chunk);

                if last_emit.elapsed() >= PROGRESS_EMIT_INTERVAL {
                    last_emit = Instant::now();
                    let fraction = if total > 0 {
                        (bytes.len() as f32 / total as f32).min(1.0)
                    } else {
                        0.0
                    };
                    let elapsed = start.elapsed().as_secs_f64();
                    let rate = if elapsed > 0.0 {
                        (bytes.len() as f64 / elapsed) as u64
                    } else {
                        0
                    };
                    on_progress(fraction, rate);
                }
            }

            let elapsed = start.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                (bytes.len() as f64 / elapsed) as u64
            } else {
                0
            };
            on_progress(1.0, rate);

            Ok(bytes)
        }
    }
}
