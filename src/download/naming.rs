//! Destination filename rendering.
//!
//! A job's filename is computed exactly once, at enqueue time, from the
//! configured template. Supported variables: `{task_name}`, `{index}`,
//! `{timestamp}` (unix milliseconds), `{date}` (YYYY-MM-DD), `{task_id}`.
//! The extension is inferred from the artifact source reference.

use chrono::{DateTime, Utc};

use crate::types::TaskId;

/// Inputs for rendering one destination filename
pub(crate) struct NamingContext<'a> {
    pub task_id: TaskId,
    pub task_name: &'a str,
    pub index: usize,
    pub now: DateTime<Utc>,
}

/// Render the template into a filename (extension included).
pub(crate) fn render(template: &str, source: &str, ctx: &NamingContext<'_>) -> String {
    let stem = template
        .replace("{task_name}", &sanitize(ctx.task_name))
        .replace("{index}", &ctx.index.to_string())
        .replace("{timestamp}", &ctx.now.timestamp_millis().to_string())
        .replace("{date}", &ctx.now.format("%Y-%m-%d").to_string())
        .replace("{task_id}", &ctx.task_id.to_string());

    let stem = sanitize(&stem);
    let stem = if stem.is_empty() { "artifact".to_string() } else { stem };

    format!("{}.{}", stem, infer_extension(source))
}

/// Strip characters that are hostile to common filesystems.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim().trim_matches('.').to_string()
}

/// Guess a file extension from the artifact source reference.
///
/// Data URIs carry a MIME type; URLs may carry a usable path extension.
/// Everything unrecognized falls back to "png".
pub(crate) fn infer_extension(source: &str) -> &'static str {
    if let Some(rest) = source.strip_prefix("data:") {
        let mime = rest.split([';', ',']).next().unwrap_or("");
        return match mime {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        };
    }

    let path = source.split(['?', '#']).next().unwrap_or(source);
    match path.rsplit('.').next() {
        Some("jpg") | Some("jpeg") => "jpg",
        Some("webp") => "webp",
        Some("gif") => "gif",
        Some("png") => "png",
        _ => "png",
    }
}
