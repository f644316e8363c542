//! Content type guessing for uploaded files

/// Fallback used when the extension is unknown
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Content type for JSON documents such as the job metadata record
pub const JSON: &str = "application/json";

/// Guess a content type from the extension of an object key or file name
pub fn guess_content_type(key: &str) -> &'static str {
    let extension = key
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("dzi") | Some("xml") => "application/xml",
        Some("json") => JSON,
        _ => OCTET_STREAM,
    }
}
