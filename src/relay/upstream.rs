//! Upstream driver
//!
//! Drains the session's outbound queue onto the ASR upload connection, one
//! flushed frame at a time, until a terminal marker has been written.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::transport::UploadAnswer;
use super::RelayError;
use crate::protocol::{codec, RequestFrame, RequestType};

/// What was written before the driver stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub frames_sent: usize,
    pub bytes_sent: u64,
    /// LAST or CANCEL
    pub terminal: Option<RequestType>,
}

pub struct UpstreamDriver<W> {
    session_id: String,
    sink: W,
    poll_timeout: Duration,
    cancel: CancellationToken,
}

impl<W: AsyncWrite + Unpin> UpstreamDriver<W> {
    pub fn new(
        session_id: impl Into<String>,
        sink: W,
        poll_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sink,
            poll_timeout,
            cancel,
        }
    }

    /// Run until the terminal marker is written, the queue stalls for a full
    /// poll window, the queue closes, or the session is cancelled.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<RequestFrame>,
    ) -> Result<UploadReport, RelayError> {
        let mut report = UploadReport::default();

        loop {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("Upstream[{}]: cancelled after {} frames", self.session_id, report.frames_sent);
                    self.close().await;
                    return Err(RelayError::Cancelled);
                }
                polled = timeout(self.poll_timeout, rx.recv()) => polled,
            };

            let frame = match polled {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    log::warn!(
                        "Upstream[{}]: queue closed without a terminal marker ({} frames sent)",
                        self.session_id,
                        report.frames_sent
                    );
                    self.close().await;
                    return Err(RelayError::UpstreamIncomplete {
                        frames_sent: report.frames_sent,
                    });
                }
                Err(_) => {
                    log::warn!(
                        "Upstream[{}]: no frame within {:?}, closing upload ({} frames sent)",
                        self.session_id,
                        self.poll_timeout,
                        report.frames_sent
                    );
                    self.close().await;
                    return Err(RelayError::UpstreamIncomplete {
                        frames_sent: report.frames_sent,
                    });
                }
            };

            let wire = codec::encode(&frame);
            self.sink
                .write_all(&wire)
                .await
                .map_err(|e| RelayError::UploadFailed(e.to_string()))?;
            self.sink
                .flush()
                .await
                .map_err(|e| RelayError::UploadFailed(e.to_string()))?;

            report.frames_sent += 1;
            report.bytes_sent += wire.len() as u64;

            if frame.is_terminal() {
                report.terminal = Some(frame.request_type());
                self.sink
                    .shutdown()
                    .await
                    .map_err(|e| RelayError::UploadFailed(e.to_string()))?;
                log::info!(
                    "Upstream[{}]: upload complete ({} frames, {} bytes)",
                    self.session_id,
                    report.frames_sent,
                    report.bytes_sent
                );
                return Ok(report);
            }
        }
    }

    /// [`run`](Self::run) while also driving the backend's answer to the
    /// upload request. An upload the backend rejected is `UploadFailed`,
    /// even if every frame was written.
    pub async fn run_until_answered(
        self,
        rx: mpsc::Receiver<RequestFrame>,
        answer: UploadAnswer,
    ) -> Result<UploadReport, RelayError> {
        let session_id = self.session_id.clone();
        let answer_timeout = self.poll_timeout;
        let cancel = self.cancel.clone();

        let upload = self.run(rx);
        tokio::pin!(upload);
        let mut answer = answer;
        let mut answered = None;
        let report = loop {
            tokio::select! {
                report = &mut upload => break report,
                result = &mut answer, if answered.is_none() => answered = Some(result),
            }
        };
        let report = report?;

        let answered = match answered {
            Some(result) => result,
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RelayError::Cancelled),
                result = timeout(answer_timeout, answer) => result.unwrap_or_else(|_| {
                    Err(RelayError::UploadFailed(format!(
                        "no answer to the upload within {:?}",
                        answer_timeout
                    )))
                }),
            },
        };

        match answered {
            Ok(()) => Ok(report),
            Err(e) => {
                log::warn!("Upstream[{}]: upload not accepted: {}", session_id, e);
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.shutdown().await {
            log::debug!("Upstream[{}]: shutdown failed: {}", self.session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ApiParam, Decoded};
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    fn decode_all(mut buf: &[u8]) -> Vec<RequestFrame> {
        let mut frames = Vec::new();
        while let Decoded::Frame { frame, consumed } = codec::decode::<RequestFrame>(buf).unwrap() {
            frames.push(frame);
            buf = &buf[consumed..];
        }
        frames
    }

    #[tokio::test]
    async fn test_writes_frames_until_last() {
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(8);
        let driver = UpstreamDriver::new(
            "s1",
            writer,
            Duration::from_secs(5),
            CancellationToken::new(),
        );

        let frames = vec![
            RequestFrame::Auth(ApiParam::pcm16k("cuid", "key")),
            RequestFrame::Data(Bytes::from_static(b"pcm")),
            RequestFrame::Last,
        ];
        for frame in &frames {
            tx.send(frame.clone()).await.unwrap();
        }

        let report = driver.run(rx).await.unwrap();
        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.terminal, Some(RequestType::Last));

        let mut written = Vec::new();
        reader.read_to_end(&mut written).await.unwrap();
        assert_eq!(written.len() as u64, report.bytes_sent);
        assert_eq!(decode_all(&written), frames);
    }

    #[tokio::test]
    async fn test_stops_at_terminal_marker() {
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(8);
        tx.send(RequestFrame::Cancel).await.unwrap();
        tx.send(RequestFrame::Data(Bytes::from_static(b"late")))
            .await
            .unwrap();

        let driver = UpstreamDriver::new("s1", writer, Duration::from_secs(5), CancellationToken::new());
        let report = driver.run(rx).await.unwrap();
        assert_eq!(report.terminal, Some(RequestType::Cancel));

        let mut written = Vec::new();
        reader.read_to_end(&mut written).await.unwrap();
        assert_eq!(decode_all(&written), vec![RequestFrame::Cancel]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_queue_reports_incomplete_upload() {
        let (writer, _reader) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(8);
        tx.send(RequestFrame::Data(Bytes::from_static(b"pcm")))
            .await
            .unwrap();

        let driver = UpstreamDriver::new("s1", writer, Duration::from_secs(30), CancellationToken::new());
        let result = driver.run(rx).await;

        assert!(matches!(
            result,
            Err(RelayError::UpstreamIncomplete { frames_sent: 1 })
        ));
        drop(tx);
    }

    #[tokio::test]
    async fn test_closed_queue_reports_incomplete_upload() {
        let (writer, _reader) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::channel::<RequestFrame>(8);
        drop(tx);

        let driver = UpstreamDriver::new("s1", writer, Duration::from_secs(5), CancellationToken::new());
        assert!(matches!(
            driver.run(rx).await,
            Err(RelayError::UpstreamIncomplete { frames_sent: 0 })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_the_poll() {
        let (writer, _reader) = tokio::io::duplex(1024);
        let (_tx, rx) = mpsc::channel::<RequestFrame>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let driver = UpstreamDriver::new("s1", writer, Duration::from_secs(3600), cancel);
        assert!(matches!(driver.run(rx).await, Err(RelayError::Cancelled)));
    }

    #[tokio::test]
    async fn test_write_failure_is_upload_failed() {
        let (writer, reader) = tokio::io::duplex(16);
        drop(reader);
        let (tx, rx) = mpsc::channel(8);
        tx.send(RequestFrame::Last).await.unwrap();

        let driver = UpstreamDriver::new("s1", writer, Duration::from_secs(5), CancellationToken::new());
        assert!(matches!(driver.run(rx).await, Err(RelayError::UploadFailed(_))));
    }

    #[tokio::test]
    async fn test_rejected_upload_is_upload_failed() {
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(8);
        tx.send(RequestFrame::Last).await.unwrap();

        // The backend reads the whole body, then answers with an error
        let answer: UploadAnswer = Box::pin(async move {
            let mut body = Vec::new();
            let _ = reader.read_to_end(&mut body).await;
            Err(RelayError::UploadFailed(format!("HTTP 500 after {} bytes", body.len())))
        });

        let driver = UpstreamDriver::new("s1", writer, Duration::from_secs(5), CancellationToken::new());
        assert!(matches!(
            driver.run_until_answered(rx, answer).await,
            Err(RelayError::UploadFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_accepted_upload_keeps_the_report() {
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(8);
        tx.send(RequestFrame::Data(Bytes::from_static(b"pcm")))
            .await
            .unwrap();
        tx.send(RequestFrame::Last).await.unwrap();

        let answer: UploadAnswer = Box::pin(async move {
            let mut body = Vec::new();
            let _ = reader.read_to_end(&mut body).await;
            Ok(())
        });

        let driver = UpstreamDriver::new("s1", writer, Duration::from_secs(5), CancellationToken::new());
        let report = driver.run_until_answered(rx, answer).await.unwrap();
        assert_eq!(report.frames_sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_answer_is_bounded() {
        let (writer, _reader) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(8);
        tx.send(RequestFrame::Last).await.unwrap();

        let answer: UploadAnswer = Box::pin(futures_util::future::pending());
        let driver = UpstreamDriver::new("s1", writer, Duration::from_secs(30), CancellationToken::new());
        assert!(matches!(
            driver.run_until_answered(rx, answer).await,
            Err(RelayError::UploadFailed(_))
        ));
    }
}
