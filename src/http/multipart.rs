//! `multipart/form-data` body parsing.
//!
//! Text fields land in the form map; file parts are spilled to unnamed
//! temporary files that are removed when the request is dropped. The
//! whole body is bounded by the server's request size limit.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{Error, ProtocolError, Result};
use crate::stream::{InputStream, IoMode};

/// One uploaded file from a multipart body.
#[derive(Debug)]
pub struct UploadedFile {
    /// The form field name.
    pub field: String,
    /// The client-supplied file name.
    pub filename: String,
    pub content_type: String,
    /// Size of the spilled file in bytes.
    pub size: u64,
    temp: NamedTempFile,
}

impl UploadedFile {
    /// Path of the temporary spill file; valid until the value is
    /// dropped.
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Reads the whole upload back into memory.
    pub fn contents(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size as usize);
        self.temp.as_file_mut().seek(SeekFrom::Start(0))?;
        self.temp.as_file_mut().read_to_end(&mut out)?;
        Ok(out)
    }

    /// Moves the upload to a permanent location.
    pub fn persist(self, target: &Path) -> Result<()> {
        self.temp
            .persist(target)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

pub struct ParsedMultipart {
    pub fields: HashMap<String, String>,
    pub files: Vec<UploadedFile>,
}

/// Extracts the boundary parameter from a `multipart/form-data`
/// content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

/// Parses a complete multipart body. The body is consumed up to its
/// closing boundary.
pub fn parse(
    body: &mut (impl InputStream + ?Sized),
    boundary: &str,
    limit: u64,
) -> Result<ParsedMultipart> {
    let mut data = Vec::new();
    let mut chunk = [0u8; 8 * 1024];
    loop {
        let n = body.read(&mut chunk, IoMode::Once)?;
        if n == 0 {
            break;
        }
        if data.len() as u64 + n as u64 > limit {
            return Err(ProtocolError::BodyTooLarge.into());
        }
        data.extend_from_slice(&chunk[..n]);
    }
    parse_buffer(&data, boundary)
}

fn parse_buffer(data: &[u8], boundary: &str) -> Result<ParsedMultipart> {
    let delimiter = format!("--{boundary}");
    let mut fields = HashMap::new();
    let mut files = Vec::new();

    // Position after the first boundary line.
    let first = find(data, delimiter.as_bytes())
        .ok_or(ProtocolError::InvalidChunk("missing multipart boundary"))?;
    let mut pos = first + delimiter.len();

    loop {
        // A closing "--" after the boundary terminates the body.
        if data[pos..].starts_with(b"--") {
            return Ok(ParsedMultipart { fields, files });
        }
        pos += skip_crlf(&data[pos..]);

        // Part headers up to the empty line.
        let headers_end = find(&data[pos..], b"\r\n\r\n")
            .ok_or(ProtocolError::InvalidChunk("unterminated multipart headers"))?;
        let header_bytes = &data[pos..pos + headers_end];
        pos += headers_end + 4;

        let mut name = String::new();
        let mut filename: Option<String> = None;
        let mut content_type = String::from("text/plain");
        for line in header_bytes.split(|&b| b == b'\n') {
            let line = std::str::from_utf8(line)
                .map_err(|_| ProtocolError::InvalidChunk("non-utf8 multipart header"))?
                .trim_end_matches('\r')
                .trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.eq_ignore_ascii_case("content-disposition") {
                for param in value.split(';') {
                    let param = param.trim();
                    if let Some((k, v)) = param.split_once('=') {
                        let v = v.trim().trim_matches('"');
                        match k.trim().to_ascii_lowercase().as_str() {
                            "name" => name = v.to_string(),
                            "filename" => filename = Some(v.to_string()),
                            _ => {}
                        }
                    }
                }
            } else if key.eq_ignore_ascii_case("content-type") {
                content_type = value.trim().to_string();
            }
        }

        // Part content runs until the next CRLF + boundary.
        let closing = format!("\r\n{delimiter}");
        let content_end = find(&data[pos..], closing.as_bytes())
            .ok_or(ProtocolError::InvalidChunk("unterminated multipart part"))?;
        let content = &data[pos..pos + content_end];
        pos += content_end + closing.len();

        match filename {
            Some(filename) => {
                let mut temp = NamedTempFile::new()?;
                temp.write_all(content)?;
                temp.flush()?;
                files.push(UploadedFile {
                    field: name,
                    filename,
                    content_type,
                    size: content.len() as u64,
                    temp,
                });
            }
            None => {
                let value = String::from_utf8_lossy(content).into_owned();
                fields.insert(name, value);
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

fn skip_crlf(data: &[u8]) -> usize {
    if data.starts_with(b"\r\n") {
        2
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    const BODY: &[u8] = b"--XXX\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\r\n\
hello world\r\n\
--XXX\r\n\
Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
file contents\nwith newline\r\n\
--XXX--\r\n";

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=XXX").as_deref(),
            Some("XXX")
        );
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=\"quoted\"").as_deref(),
            Some("quoted")
        );
        assert_eq!(boundary_from_content_type("multipart/form-data"), None);
    }

    #[test]
    fn fields_and_files_are_separated() {
        let mut body = MemoryStream::from_vec(BODY.to_vec());
        let mut parsed = parse(&mut body, "XXX", 1 << 20).unwrap();
        assert_eq!(parsed.fields["title"], "hello world");
        assert_eq!(parsed.files.len(), 1);
        let file = &mut parsed.files[0];
        assert_eq!(file.field, "upload");
        assert_eq!(file.filename, "a.txt");
        assert_eq!(file.content_type, "text/plain");
        assert_eq!(file.contents().unwrap(), b"file contents\nwith newline");
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut body = MemoryStream::from_vec(vec![b'x'; 4096]);
        assert!(parse(&mut body, "XXX", 128).is_err());
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let mut body = MemoryStream::from_vec(b"--XXX\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nvalue".to_vec());
        assert!(parse(&mut body, "XXX", 1 << 20).is_err());
    }
}
