//! [`StorageTransport`] backed by presigned URLs from the ingest API.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Body;
use tracing::debug;

use super::error::TransportError;
use super::transport::{
    PhotoTarget, StorageTransport, StoredObject, TransferHandle, TransferReporter, TransferRequest,
};
use crate::api_client::{check, ApiClientError, ScanApiClient};

pub struct HttpStorageTransport {
    api: Arc<ScanApiClient>,
    chunk_size: usize,
}

impl HttpStorageTransport {
    pub fn new(api: Arc<ScanApiClient>, chunk_size: usize) -> Self {
        Self {
            api,
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl StorageTransport for HttpStorageTransport {
    fn start(&self, request: TransferRequest) -> TransferHandle {
        let api = self.api.clone();
        let chunk_size = self.chunk_size;
        let total = request.body.len() as u64;

        TransferHandle::spawn(total, move |reporter| async move {
            let target = &request.target;
            let upload = api
                .upload_target(&target.uid, &target.scan_id, target.pose)
                .await?;

            debug!(path = %upload.path, bytes = total, "Streaming photo");
            let response = api
                .http()
                .put(&upload.url)
                .header(CONTENT_TYPE, &request.content_type)
                .header(CONTENT_LENGTH, total)
                .body(Body::wrap_stream(chunked_body(request.body, chunk_size, reporter)))
                .send()
                .await
                .map_err(ApiClientError::from)?;
            check(response).await?;

            Ok(StoredObject {
                storage_path: upload.storage_path,
            })
        })
    }

    async fn download_url(&self, target: &PhotoTarget) -> Result<String, TransportError> {
        Ok(self
            .api
            .download_url(&target.uid, &target.scan_id, target.pose)
            .await?)
    }
}

/// Split `body` into chunks, reporting each as sent and pausing between chunks
/// while the transfer is paused.
fn chunked_body(
    body: Bytes,
    chunk_size: usize,
    reporter: TransferReporter,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    stream::unfold(
        (body, 0usize, reporter),
        move |(body, offset, mut reporter)| async move {
            if offset >= body.len() {
                return None;
            }
            if let Err(e) = reporter.checkpoint().await {
                let end = body.len();
                let err = io::Error::new(io::ErrorKind::Interrupted, e.to_string());
                return Some((Err(err), (body, end, reporter)));
            }

            let end = (offset + chunk_size).min(body.len());
            let chunk = body.slice(offset..end);
            reporter.advance(chunk.len() as u64);
            Some((Ok(chunk), (body, end, reporter)))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_chunked_body_reports_progress() {
        let body = Bytes::from(vec![7u8; 10]);
        let handle = TransferHandle::spawn(10, move |reporter| async move {
            let chunks: Vec<_> = chunked_body(body, 4, reporter).collect().await;
            let sizes: Vec<usize> = chunks.into_iter().map(|c| c.unwrap().len()).collect();
            assert_eq!(sizes, vec![4, 4, 2]);
            Ok(StoredObject {
                storage_path: "mem://x".to_string(),
            })
        });

        handle.completion.await.unwrap().unwrap();
        assert_eq!(handle.progress.borrow().bytes_transferred, 10);
    }

    #[tokio::test]
    async fn test_chunked_body_stops_when_cancelled() {
        let body = Bytes::from(vec![7u8; 10]);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = TransferHandle::spawn(10, move |reporter| async move {
            let mut chunks = Box::pin(chunked_body(body, 4, reporter));
            let first = chunks.next().await;
            let _ = tx.send(first.map(|c| c.is_ok()));
            std::future::pending().await
        });

        assert_eq!(rx.await.unwrap(), Some(true));
        handle.control.cancel();
        let result = handle.completion.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }
}
