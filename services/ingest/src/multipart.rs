//! `multipart/form-data` intake.
//!
//! Two entry points share one decoder: [`parse_buffered`] for bodies that are
//! already in memory, and [`parse_stream`] which enforces size ceilings while
//! the body is still arriving and gives up on the first one exceeded.
//! [`buffer_body`] fills the buffer for the first one and names the part a
//! too-large body was cut off in.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use multer::{Constraints, Multipart, SizeLimit};
use std::collections::HashMap;
use std::convert::Infallible;
use thiserror::Error;
use tracing::debug;

/// Multipart decoding failures.
#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("request is not multipart/form-data with a boundary")]
    MissingBoundary,

    #[error("part {field:?} exceeds its size limit")]
    FieldTooLarge { field: String },

    #[error("request body exceeds its size limit")]
    BodyTooLarge,

    #[error("multipart part has no field name")]
    UnnamedPart,

    #[error("field {field:?} is not valid UTF-8")]
    InvalidText { field: String },

    #[error("malformed multipart body: {0}")]
    Malformed(String),
}

impl From<multer::Error> for MultipartError {
    fn from(err: multer::Error) -> Self {
        match err {
            multer::Error::FieldSizeExceeded { field_name, .. } => MultipartError::FieldTooLarge {
                field: field_name.unwrap_or_default(),
            },
            multer::Error::StreamSizeExceeded { .. } => MultipartError::BodyTooLarge,
            multer::Error::NoBoundary | multer::Error::NoMultipart => MultipartError::MissingBoundary,
            other => MultipartError::Malformed(other.to_string()),
        }
    }
}

/// A part that carried a filename.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub field: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Decoded form: scalar fields by name, file parts in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedForm {
    pub fields: HashMap<String, String>,
    pub files: Vec<UploadedFile>,
}

impl ParsedForm {
    /// First non-empty value among `names`.
    pub fn field(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.fields.get(*name))
            .map(String::as_str)
            .find(|value| !value.is_empty())
    }
}

/// Ceilings applied by [`parse_stream`].
#[derive(Debug, Clone)]
pub struct StreamLimits {
    /// Whole request body
    pub whole_stream: u64,
    /// Any part without its own limit
    pub per_field: u64,
    /// Limits for specific part names
    pub named_fields: HashMap<String, u64>,
}

impl StreamLimits {
    pub fn new(whole_stream: u64, per_field: u64) -> Self {
        Self {
            whole_stream,
            per_field,
            named_fields: HashMap::new(),
        }
    }

    pub fn with_field_limit(mut self, name: impl Into<String>, limit: u64) -> Self {
        self.named_fields.insert(name.into(), limit);
        self
    }

    fn constraints(&self) -> Constraints {
        let limit = self.named_fields.iter().fold(
            SizeLimit::new()
                .whole_stream(self.whole_stream)
                .per_field(self.per_field),
            |limit, (name, bytes)| limit.for_field(name.clone(), *bytes),
        );
        Constraints::new().size_limit(limit)
    }
}

/// Decode a body that is already fully buffered.
pub async fn parse_buffered(body: Bytes, content_type: &str) -> Result<ParsedForm, MultipartError> {
    let boundary = multer::parse_boundary(content_type)?;
    let stream = stream::once(async move { Ok::<Bytes, Infallible>(body) });
    collect(Multipart::new(stream, boundary)).await
}

/// Read a body into memory, giving up once it passes `limit` bytes.
///
/// An overflow is reported against the part the body was cut off in, or as
/// [`MultipartError::BodyTooLarge`] when that part has no name.
pub async fn buffer_body<S, E>(body: S, content_type: &str, limit: usize) -> Result<Bytes, MultipartError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut body = std::pin::pin!(body);
    let mut buf = BytesMut::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| MultipartError::Malformed(e.into().to_string()))?;
        if buf.len() + chunk.len() > limit {
            let room = limit - buf.len();
            buf.extend_from_slice(&chunk[..room]);
            return Err(overflowing_part(buf.freeze(), content_type).await);
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(buf.freeze())
}

/// Walk a truncated body to the part that was still open when it ended.
async fn overflowing_part(prefix: Bytes, content_type: &str) -> MultipartError {
    let Ok(boundary) = multer::parse_boundary(content_type) else {
        return MultipartError::BodyTooLarge;
    };
    let stream = stream::once(async move { Ok::<Bytes, Infallible>(prefix) });
    let mut multipart = Multipart::new(stream, boundary);

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().map(str::to_string);
        if field.bytes().await.is_err() {
            return match name {
                Some(field) if !field.is_empty() => {
                    debug!(field = %field, "Body cut off inside part");
                    MultipartError::FieldTooLarge { field }
                }
                _ => MultipartError::BodyTooLarge,
            };
        }
    }
    MultipartError::BodyTooLarge
}

/// Decode a body as it arrives, stopping at the first exceeded ceiling.
pub async fn parse_stream<S, E>(
    body: S,
    content_type: &str,
    limits: &StreamLimits,
) -> Result<ParsedForm, MultipartError>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let boundary = multer::parse_boundary(content_type)?;
    collect(Multipart::with_constraints(body, boundary, limits.constraints())).await
}

async fn collect(mut multipart: Multipart<'_>) -> Result<ParsedForm, MultipartError> {
    let mut form = ParsedForm::default();

    while let Some(field) = multipart.next_field().await? {
        let name = match field.name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(MultipartError::UnnamedPart),
        };
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(|mime| mime.essence_str().to_string());

        let bytes = field.bytes().await?;

        match filename {
            Some(filename) => {
                debug!(field = %name, filename = %filename, size = bytes.len(), "File part received");
                form.files.push(UploadedFile {
                    field: name,
                    filename,
                    content_type,
                    bytes,
                });
            }
            None => {
                let text = std::str::from_utf8(&bytes)
                    .map_err(|_| MultipartError::InvalidText { field: name.clone() })?;
                form.fields.insert(name, text.trim().to_string());
            }
        }
    }

    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "scan-boundary";

    fn content_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    fn file_part(body: &mut Vec<u8>, field: &str, data: &[u8]) {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{field}.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }

    fn text_part(body: &mut Vec<u8>, field: &str, value: &str) {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"\r\n\r\n{value}\r\n")
                .as_bytes(),
        );
    }

    fn finish(mut body: Vec<u8>) -> Bytes {
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Bytes::from(body)
    }

    fn scan_body() -> Bytes {
        let mut body = Vec::new();
        text_part(&mut body, "scanId", " scan-7 ");
        for pose in ["right", "front", "left", "back"] {
            file_part(&mut body, pose, &[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]);
        }
        text_part(&mut body, "currentWeightKg", "81.4");
        finish(body)
    }

    #[tokio::test]
    async fn test_parse_buffered_splits_fields_and_files() {
        let form = parse_buffered(scan_body(), &content_type()).await.unwrap();

        assert_eq!(form.fields.get("scanId").map(String::as_str), Some("scan-7"));
        assert_eq!(form.field(&["currentWeightKg", "currentWeight"]), Some("81.4"));

        let names: Vec<_> = form.files.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(names, vec!["right", "front", "left", "back"]);
        assert!(form
            .files
            .iter()
            .all(|f| f.content_type.as_deref() == Some("image/jpeg") && f.bytes.len() == 7));
        assert_eq!(form.files[1].filename, "front.jpg");
    }

    #[tokio::test]
    async fn test_parse_stream_matches_buffered() {
        let body = scan_body();
        let chunks: Vec<Result<Bytes, Infallible>> = body
            .chunks(11)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();

        let limits = StreamLimits::new(1024 * 1024, 1024);
        let streamed = parse_stream(stream::iter(chunks), &content_type(), &limits)
            .await
            .unwrap();
        let buffered = parse_buffered(body, &content_type()).await.unwrap();

        assert_eq!(streamed, buffered);
    }

    #[tokio::test]
    async fn test_parse_stream_names_oversized_field() {
        let mut body = Vec::new();
        file_part(&mut body, "front", &[0u8; 64]);
        file_part(&mut body, "back", &[0u8; 512]);
        let body = finish(body);

        let limits = StreamLimits::new(1024 * 1024, 16).with_field_limit("front", 128);
        let chunks = stream::iter(vec![Ok::<_, Infallible>(body)]);

        match parse_stream(chunks, &content_type(), &limits).await {
            Err(MultipartError::FieldTooLarge { field }) => assert_eq!(field, "back"),
            other => panic!("expected FieldTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parse_stream_enforces_whole_body_limit() {
        let limits = StreamLimits::new(64, 1024 * 1024);
        let chunks = stream::iter(vec![Ok::<_, Infallible>(scan_body())]);

        let result = parse_stream(chunks, &content_type(), &limits).await;
        assert!(matches!(result, Err(MultipartError::BodyTooLarge)));
    }

    #[tokio::test]
    async fn test_missing_boundary() {
        let result = parse_buffered(scan_body(), "multipart/form-data").await;
        assert!(matches!(result, Err(MultipartError::MissingBoundary)));

        let result = parse_buffered(scan_body(), "application/json").await;
        assert!(matches!(result, Err(MultipartError::MissingBoundary)));
    }

    #[tokio::test]
    async fn test_unnamed_part_is_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"\"\r\n\r\nvalue\r\n").as_bytes(),
        );
        let result = parse_buffered(finish(body), &content_type()).await;
        assert!(matches!(result, Err(MultipartError::UnnamedPart)));
    }

    #[test]
    fn test_field_lookup_skips_empty_aliases() {
        let mut form = ParsedForm::default();
        form.fields.insert("goalWeightKg".to_string(), String::new());
        form.fields.insert("goalWeight".to_string(), "70".to_string());
        assert_eq!(form.field(&["goalWeightKg", "goalWeight"]), Some("70"));
        assert_eq!(form.field(&["missing"]), None);
    }

    #[tokio::test]
    async fn test_buffer_body_within_limit() {
        let body = scan_body();
        let chunks: Vec<Result<Bytes, Infallible>> = body
            .chunks(13)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();

        let buffered = buffer_body(stream::iter(chunks), &content_type(), body.len())
            .await
            .unwrap();
        assert_eq!(buffered, body);
    }

    #[tokio::test]
    async fn test_buffer_body_names_part_cut_off() {
        let mut body = Vec::new();
        text_part(&mut body, "scanId", "scan-9");
        file_part(&mut body, "front", &[0u8; 32]);
        file_part(&mut body, "left", &[0u8; 4096]);
        file_part(&mut body, "back", &[0u8; 32]);
        let body = finish(body);
        let chunks: Vec<Result<Bytes, Infallible>> = body
            .chunks(100)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();

        match buffer_body(stream::iter(chunks), &content_type(), 1024).await {
            Err(MultipartError::FieldTooLarge { field }) => assert_eq!(field, "left"),
            other => panic!("expected FieldTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_buffer_body_overflow_without_boundary() {
        let chunks = stream::iter(vec![Ok::<_, Infallible>(Bytes::from(vec![0u8; 64]))]);

        let err = buffer_body(chunks, "application/octet-stream", 16).await.unwrap_err();
        assert!(matches!(err, MultipartError::BodyTooLarge));
    }
}
