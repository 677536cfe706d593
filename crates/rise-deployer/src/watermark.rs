//! HTML watermark injection.
//!
//! Eligible pages get a fixed snippet advertising the hosting service,
//! placed immediately before the closing `</body>` tag, or appended when
//! the document has none. Eligibility (project flag, content type, size
//! cap) is the caller's concern; this module only rewrites.

use bytes::Bytes;
use thiserror::Error;

/// The injected fragment.
pub const WATERMARK_HTML: &str = concat!(
    r#"<div id="rise-watermark" style="position:fixed;bottom:12px;right:12px;z-index:2147483647;">"#,
    r#"<a href="https://rise.sh" target="_blank" rel="noopener">Hosted on Rise</a>"#,
    "</div>",
);

/// Why a document could not be watermarked.
#[derive(Debug, Error)]
pub enum WatermarkError {
    /// The document is not valid UTF-8 text.
    #[error("document is not valid UTF-8 text")]
    Decode,
}

/// Inject the watermark into an HTML document.
///
/// Idempotent: a document that already carries the watermark is returned
/// unchanged. On error the input is untouched; the caller skips the file
/// and moves on.
pub fn inject(html: &[u8]) -> Result<Bytes, WatermarkError> {
    let text = std::str::from_utf8(html).map_err(|_| WatermarkError::Decode)?;

    if text.contains(WATERMARK_HTML) {
        return Ok(Bytes::copy_from_slice(html));
    }

    let mut out = String::with_capacity(text.len() + WATERMARK_HTML.len());
    match rfind_ascii_case_insensitive(text, "</body>") {
        Some(idx) => {
            out.push_str(&text[..idx]);
            out.push_str(WATERMARK_HTML);
            out.push_str(&text[idx..]);
        }
        None => {
            out.push_str(text);
            out.push_str(WATERMARK_HTML);
        }
    }

    Ok(Bytes::from(out))
}

/// Byte offset of the last case-insensitive occurrence of `needle`.
fn rfind_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }

    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}
