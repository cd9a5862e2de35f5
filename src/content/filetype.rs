//! File type detection using magic bytes
//!
//! Uses the `infer` crate to detect file types from their headers. Content
//! without a known signature is classified as text when it decodes as UTF-8
//! and contains no NUL bytes, otherwise as opaque binary.

/// MIME type reported for UTF-8 text without a signature
pub const TEXT_PLAIN: &str = "text/plain";

/// MIME type reported for unrecognised binary content
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Detect the MIME type of a file from its header bytes
///
/// Returns None if no signature matches.
///
/// # Example
///
/// ```
/// use indexing_runner::content::filetype::detect_file_type;
///
/// let png_header = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
/// assert_eq!(detect_file_type(png_header), Some("image/png".to_string()));
/// assert_eq!(detect_file_type(&[0x00, 0x01, 0x02, 0x03]), None);
/// ```
pub fn detect_file_type(header: &[u8]) -> Option<String> {
    infer::get(header).map(|kind| kind.mime_type().to_string())
}

/// Classify content, falling back to text/binary when no signature matches
pub fn classify(content: &[u8]) -> String {
    if let Some(mime) = detect_file_type(content) {
        return mime;
    }
    if is_text(content) {
        TEXT_PLAIN.to_string()
    } else {
        OCTET_STREAM.to_string()
    }
}

/// Check if the content looks like UTF-8 text
pub fn is_text(content: &[u8]) -> bool {
    !content.contains(&0) && std::str::from_utf8(content).is_ok()
}
