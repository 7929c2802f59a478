//! ASR backend connections
//!
//! The relay needs two connections per session: a byte sink for the upload
//! and a chunk stream for the download. [`AsrTransport`] opens both;
//! [`HttpTransport`] does it over chunked HTTP.

use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tokio::io::AsyncWrite;
use tokio_util::io::ReaderStream;

use super::RelayError;
use crate::settings::RelaySettings;

/// Upload connection: framed request bytes go in here
pub type UploadSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Resolves once the backend has answered the upload request. Must be
/// polled alongside writes to the sink.
pub type UploadAnswer = BoxFuture<'static, Result<(), RelayError>>;

pub struct UploadConnection {
    pub sink: UploadSink,
    pub answer: UploadAnswer,
}

/// Download connection: response bytes arrive here in arbitrary chunks
pub type DownloadStream = BoxStream<'static, Result<Bytes, RelayError>>;

pub trait AsrTransport: Send + Sync {
    fn open_upload(&self, session_id: &str) -> BoxFuture<'static, Result<UploadConnection, RelayError>>;
    fn open_download(&self, session_id: &str) -> BoxFuture<'static, Result<DownloadStream, RelayError>>;
}

/// Buffer between the upstream driver and the outgoing request body
const UPLOAD_PIPE_CAPACITY: usize = 64 * 1024;

const OCTET_STREAM: &str = "application/octet-stream";

pub struct HttpTransport {
    client: Client,
    settings: RelaySettings,
}

impl HttpTransport {
    pub fn new(settings: RelaySettings) -> Result<Self, RelayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayError::UploadFailed(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, settings })
    }
}

impl AsrTransport for HttpTransport {
    /// Prepares a streaming POST whose body is fed by the returned sink.
    /// The request goes out once the answer future is polled.
    fn open_upload(&self, session_id: &str) -> BoxFuture<'static, Result<UploadConnection, RelayError>> {
        let url = self.settings.upload_url(session_id);
        let client = self.client.clone();
        let session_id = session_id.to_string();

        Box::pin(async move {
            let (writer, reader) = tokio::io::duplex(UPLOAD_PIPE_CAPACITY);
            let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
            let request = client
                .post(&url)
                .header(CONTENT_TYPE, OCTET_STREAM)
                .body(body);

            let answer = async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| RelayError::UploadFailed(e.to_string()))?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(RelayError::UploadFailed(format!("HTTP {}: {}", status, body)));
                }
                log::debug!("Transport[{}]: upload accepted", session_id);
                Ok(())
            };

            Ok(UploadConnection {
                sink: Box::new(writer),
                answer: Box::pin(answer),
            })
        })
    }

    /// Waits `download_delay_ms`, then opens the response stream.
    fn open_download(&self, session_id: &str) -> BoxFuture<'static, Result<DownloadStream, RelayError>> {
        let url = self.settings.download_url(session_id);
        let client = self.client.clone();
        let delay = self.settings.download_delay();

        Box::pin(async move {
            tokio::time::sleep(delay).await;

            // An empty POST; the backend streams frames back as the body
            let response = client
                .post(&url)
                .header(CONTENT_TYPE, OCTET_STREAM)
                .body(Bytes::new())
                .send()
                .await
                .map_err(|e| RelayError::DownloadFailed(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(RelayError::DownloadFailed(format!("HTTP {}: {}", status, body)));
            }

            Ok(response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| RelayError::DownloadFailed(e.to_string())))
                .boxed())
        })
    }
}
