//! File-extension to MIME-type mapping.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;

static MIME_TYPES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("aac", "audio/aac"),
        ("avif", "image/avif"),
        ("bin", "application/octet-stream"),
        ("bmp", "image/bmp"),
        ("css", "text/css"),
        ("csv", "text/csv"),
        ("eot", "application/vnd.ms-fontobject"),
        ("gif", "image/gif"),
        ("gz", "application/gzip"),
        ("htm", "text/html"),
        ("html", "text/html"),
        ("ico", "image/x-icon"),
        ("ics", "text/calendar"),
        ("jpeg", "image/jpeg"),
        ("jpg", "image/jpeg"),
        ("js", "application/javascript"),
        ("json", "application/json"),
        ("md", "text/markdown"),
        ("mjs", "application/javascript"),
        ("mp3", "audio/mpeg"),
        ("mp4", "video/mp4"),
        ("oga", "audio/ogg"),
        ("ogv", "video/ogg"),
        ("otf", "font/otf"),
        ("pdf", "application/pdf"),
        ("png", "image/png"),
        ("rtf", "application/rtf"),
        ("svg", "image/svg+xml"),
        ("tar", "application/x-tar"),
        ("tif", "image/tiff"),
        ("tiff", "image/tiff"),
        ("ttf", "font/ttf"),
        ("txt", "text/plain"),
        ("wasm", "application/wasm"),
        ("wav", "audio/wav"),
        ("webm", "video/webm"),
        ("webp", "image/webp"),
        ("woff", "font/woff"),
        ("woff2", "font/woff2"),
        ("xhtml", "application/xhtml+xml"),
        ("xml", "application/xml"),
        ("zip", "application/zip"),
    ])
});

/// MIME type for a file path by extension; `application/octet-stream`
/// when unknown.
pub fn mime_type_for_path(path: &Path) -> &'static str {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .and_then(|e| MIME_TYPES.get(e.as_str()).copied())
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_extensions() {
        assert_eq!(mime_type_for_path(Path::new("index.html")), "text/html");
        assert_eq!(mime_type_for_path(Path::new("IMAGE.PNG")), "image/png");
        assert_eq!(
            mime_type_for_path(Path::new("data.unknown-ext")),
            "application/octet-stream"
        );
        assert_eq!(
            mime_type_for_path(Path::new("no_extension")),
            "application/octet-stream"
        );
    }
}
