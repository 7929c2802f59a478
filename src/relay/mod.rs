//! Streaming relay
//!
//! One [`Relay::run`] call drives one session end to end:
//!
//! ```text
//! client frames -> outbound queue -> UpstreamDriver -> upload connection
//! download connection -> DownstreamDecoder -> inbound queue -> Dispatcher -> output
//! ```
//!
//! Upload and download run as worker-pool tasks; the dispatcher runs on the
//! caller's task. Every wait is bounded and cancellable through the session's
//! token.

pub mod dispatcher;
pub mod downstream;
pub mod pool;
pub mod session;
pub mod transport;
pub mod upstream;

use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tokio::sync::Mutex;

use crate::dialog::{Augmentor, DialogIdentity};
use crate::metrics::{MetricsCollector, SessionMetrics};
use crate::protocol::{codec, upload_plan, ApiParam, CodecError, ResponseFrame, ResponseKind};
use crate::settings::RelaySettings;
use crate::state_machine::Completion;

pub use dispatcher::{AugmentationOutcome, DispatchOutcome, Dispatcher, PendingAugmentation};
pub use downstream::{DecodeStats, DownstreamDecoder};
pub use pool::WorkerPool;
pub use session::{RequestSender, Session};
pub use transport::{
    AsrTransport, DownloadStream, HttpTransport, UploadAnswer, UploadConnection, UploadSink,
};
pub use upstream::{UploadReport, UpstreamDriver};

/// Error code on the RES frame that terminates a truncated client sequence
pub const FAILURE_ERR_NO: i32 = -3003;

/// Errors that can occur while relaying a session
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Malformed length or body; the chunk was dropped
    CorruptFrame(CodecError),
    /// Upload stopped before LAST/CANCEL was written
    UpstreamIncomplete { frames_sent: usize },
    /// No response frame within the poll window and no LAST seen
    DownstreamTimeout { frames_received: usize },
    /// Download ended without a LAST frame
    DownstreamClosed { frames_received: usize },
    /// Dialog round trip failed, timed out, or returned no classification
    AugmentationUnavailable(String),
    /// Upload connection could not be opened or written
    UploadFailed(String),
    /// Download connection could not be opened or read
    DownloadFailed(String),
    /// Frame queued after the terminal marker, or the upload queue is gone
    UploadClosed,
    /// Session queues were already taken by another run
    SessionInUse,
    Cancelled,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::CorruptFrame(e) => write!(f, "{}", e),
            RelayError::UpstreamIncomplete { frames_sent } => write!(
                f,
                "Upload ended without a terminal marker after {} frames",
                frames_sent
            ),
            RelayError::DownstreamTimeout { frames_received } => write!(
                f,
                "No response frame within the poll window ({} received, no LAST)",
                frames_received
            ),
            RelayError::DownstreamClosed { frames_received } => write!(
                f,
                "Response stream ended without LAST ({} frames received)",
                frames_received
            ),
            RelayError::AugmentationUnavailable(reason) => {
                write!(f, "Augmentation unavailable: {}", reason)
            }
            RelayError::UploadFailed(e) => write!(f, "Upload failed: {}", e),
            RelayError::DownloadFailed(e) => write!(f, "Download failed: {}", e),
            RelayError::UploadClosed => write!(f, "Upload already closed"),
            RelayError::SessionInUse => write!(f, "Session queues already taken"),
            RelayError::Cancelled => write!(f, "Session cancelled"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<CodecError> for RelayError {
    fn from(e: CodecError) -> Self {
        RelayError::CorruptFrame(e)
    }
}

/// Everything one session produced
#[derive(Debug)]
pub struct SessionOutput {
    pub session_id: String,
    /// Dispatcher output, in order. Ends with LAST when complete.
    pub frames: Vec<ResponseFrame>,
    pub completion: Completion,
    pub augmentation: AugmentationOutcome,
    pub upload: Result<UploadReport, RelayError>,
    pub download: Result<DecodeStats, RelayError>,
    pub metrics: SessionMetrics,
    frames_received: usize,
    synthesize_failure_frames: bool,
}

impl SessionOutput {
    pub fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    /// Why the sequence ended without LAST
    pub fn incomplete_error(&self) -> Option<RelayError> {
        dispatcher::incomplete_error(self.completion, self.frames_received)
    }

    /// Problems worth reporting, connection failures first. Teardown of
    /// tasks still running after a complete sequence is not a problem.
    pub fn problems(&self) -> Vec<RelayError> {
        let teardown = |e: &RelayError| self.is_complete() && *e == RelayError::Cancelled;
        let mut problems = Vec::new();
        if let Err(e) = &self.upload {
            if !teardown(e) {
                problems.push(e.clone());
            }
        }
        if let Err(e) = &self.download {
            if !teardown(e) {
                problems.push(e.clone());
            }
        }
        if let Some(e) = self.incomplete_error() {
            if !problems.contains(&e) {
                problems.push(e);
            }
        }
        if let Some(e) = self.augmentation.as_error() {
            problems.push(e);
        }
        problems
    }

    /// The frames the client should receive. A truncated sequence gets a
    /// failure RES and a LAST appended when so configured.
    pub fn client_frames(&self) -> Vec<ResponseFrame> {
        let mut frames = self.frames.clone();
        if let Some(reason) = self.incomplete_error() {
            if self.synthesize_failure_frames {
                let id = frames
                    .last()
                    .map(|f| f.id.clone())
                    .unwrap_or_else(|| self.session_id.clone());
                frames.push(ResponseFrame::failure(
                    id.clone(),
                    FAILURE_ERR_NO,
                    reason.to_string(),
                ));
                frames.push(ResponseFrame::last(id, None));
            }
        }
        frames
    }

    /// Client byte stream: every client frame, length-prefixed
    pub fn encode_for_client(&self) -> Bytes {
        let mut out = BytesMut::new();
        for frame in self.client_frames() {
            out.extend_from_slice(&codec::encode(&frame));
        }
        out.freeze()
    }

    /// Final text: the LAST frame's result, else the last RES result
    pub fn transcript(&self) -> Option<String> {
        let from_last = self
            .frames
            .iter()
            .rev()
            .find(|f| f.is_last())
            .and_then(|f| f.result())
            .map(|r| r.utterance());
        from_last.or_else(|| {
            self.frames
                .iter()
                .rev()
                .find(|f| matches!(f.kind, ResponseKind::Res { .. }))
                .and_then(|f| f.result())
                .map(|r| r.utterance())
        })
    }
}

/// Shared relay: transport, augmentor and worker pool for any number of
/// sessions
pub struct Relay {
    transport: Arc<dyn AsrTransport>,
    augmentor: Arc<dyn Augmentor>,
    pool: WorkerPool,
    settings: RelaySettings,
    metrics: Arc<Mutex<MetricsCollector>>,
}

impl Relay {
    pub fn new(
        transport: Arc<dyn AsrTransport>,
        augmentor: Arc<dyn Augmentor>,
        pool: WorkerPool,
        settings: RelaySettings,
    ) -> Self {
        Self {
            transport,
            augmentor,
            pool,
            settings,
            metrics: Arc::new(Mutex::new(MetricsCollector::new())),
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn metrics(&self) -> Arc<Mutex<MetricsCollector>> {
        Arc::clone(&self.metrics)
    }

    pub fn open_session(&self, identity: DialogIdentity) -> Session {
        let session = Session::new(identity);
        log::info!("Relay: opened session {}", session.id());
        session
    }

    /// Relay a whole utterance: AUTH, the audio in blocks, LAST.
    pub async fn relay_audio(
        &self,
        identity: DialogIdentity,
        auth: ApiParam,
        audio: &[u8],
    ) -> Result<SessionOutput, RelayError> {
        let session = self.open_session(identity);
        let plan = upload_plan(auth, audio, self.settings.block_size);
        log::debug!(
            "Relay[{}]: queuing {} frames for {} audio bytes",
            session.id(),
            plan.len(),
            audio.len()
        );

        // The plan can exceed the outbound capacity, so queue it alongside
        // the run rather than before it
        let sender = session.sender();
        let (output, fed) = tokio::join!(self.run(session), sender.send_all(plan));
        let output = output?;
        if let Err(e) = fed {
            log::warn!("Relay[{}]: feeding upload: {}", output.session_id, e);
        }
        Ok(output)
    }

    /// Drive one session to completion. Frames are queued by the caller
    /// through `session.sender()`, before or during the run.
    pub async fn run(&self, mut session: Session) -> Result<SessionOutput, RelayError> {
        let outbound_rx = session
            .take_outbound_receiver()
            .ok_or(RelayError::SessionInUse)?;
        let inbound_tx = session
            .take_inbound_sender()
            .ok_or(RelayError::SessionInUse)?;
        let inbound_rx = session
            .take_inbound_receiver()
            .ok_or(RelayError::SessionInUse)?;

        let session_id = session.id().to_string();
        let started = Instant::now();
        let started_at = Utc::now();

        // Upload and download stop when the dispatcher is done or the
        // session is cancelled, whichever comes first
        let tasks_cancel = session.cancel_token().child_token();

        let upload_task = {
            let transport = Arc::clone(&self.transport);
            let id = session_id.clone();
            let poll_timeout = self.settings.poll_timeout();
            let cancel = tasks_cancel.clone();
            self.pool.spawn(async move {
                let connection = transport.open_upload(&id).await?;
                UpstreamDriver::new(id, connection.sink, poll_timeout, cancel)
                    .run_until_answered(outbound_rx, connection.answer)
                    .await
            })
        };

        let download_task = {
            let transport = Arc::clone(&self.transport);
            let id = session_id.clone();
            let max_frame_len = self.settings.max_frame_len;
            let cancel = tasks_cancel.clone();
            self.pool.spawn(async move {
                let stream = tokio::select! {
                    _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                    opened = transport.open_download(&id) => opened?,
                };
                DownstreamDecoder::new(id, inbound_tx, max_frame_len)
                    .pump(stream, cancel)
                    .await
            })
        };

        let dispatched = Dispatcher::new(
            &session,
            Arc::clone(&self.augmentor),
            self.pool.clone(),
            &self.settings,
        )
        .run(inbound_rx)
        .await;

        tasks_cancel.cancel();
        let upload = upload_task
            .await
            .unwrap_or_else(|e| Err(RelayError::UploadFailed(format!("upload task failed: {}", e))));
        let download = download_task.await.unwrap_or_else(|e| {
            Err(RelayError::DownloadFailed(format!("download task failed: {}", e)))
        });

        let output = self.finish(session_id, dispatched, upload, download, started, started_at);
        self.metrics.lock().await.record_session(output.metrics.clone());
        Ok(output)
    }

    fn finish(
        &self,
        session_id: String,
        dispatched: DispatchOutcome,
        upload: Result<UploadReport, RelayError>,
        download: Result<DecodeStats, RelayError>,
        started: Instant,
        started_at: chrono::DateTime<Utc>,
    ) -> SessionOutput {
        let upload_report = upload.as_ref().ok().cloned().unwrap_or_default();
        let decode_stats = download.as_ref().ok().cloned().unwrap_or_default();

        let mut output = SessionOutput {
            session_id: session_id.clone(),
            frames: dispatched.frames,
            completion: dispatched.completion,
            augmentation: dispatched.augmentation,
            upload,
            download,
            metrics: SessionMetrics {
                session_id,
                started_at,
                frames_sent: upload_report.frames_sent,
                bytes_sent: upload_report.bytes_sent,
                chunks_received: decode_stats.chunks,
                frames_decoded: decode_stats.frames,
                dropped_chunks: decode_stats.dropped_chunks,
                frames_emitted: 0,
                augmentation: String::new(),
                augmentation_latency_ms: None,
                total_ms: started.elapsed().as_millis() as u64,
                complete: false,
                error_message: None,
            },
            frames_received: dispatched.frames_received,
            synthesize_failure_frames: self.settings.synthesize_failure_frames,
        };

        output.metrics.frames_emitted = output.frames.len();
        output.metrics.augmentation = output.augmentation.as_str().to_string();
        output.metrics.augmentation_latency_ms =
            output.augmentation.latency().map(|d| d.as_millis() as u64);
        output.metrics.complete = output.is_complete();
        output.metrics.error_message = output.problems().first().map(|e| e.to_string());

        for problem in output.problems() {
            log::warn!("Relay[{}]: {}", output.session_id, problem);
        }
        log::info!(
            "Relay[{}]: closed ({}, {} frames)",
            output.session_id,
            output.completion.as_str(),
            output.frames.len()
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AsrResult, Decoded};

    fn output(frames: Vec<ResponseFrame>, completion: Completion) -> SessionOutput {
        SessionOutput {
            session_id: "s1".to_string(),
            frames_received: frames.len(),
            frames,
            completion,
            augmentation: AugmentationOutcome::NotAttempted,
            upload: Ok(UploadReport::default()),
            download: Ok(DecodeStats::default()),
            metrics: SessionMetrics {
                session_id: "s1".to_string(),
                started_at: Utc::now(),
                frames_sent: 0,
                bytes_sent: 0,
                chunks_received: 0,
                frames_decoded: 0,
                dropped_chunks: 0,
                frames_emitted: 0,
                augmentation: "not_attempted".to_string(),
                augmentation_latency_ms: None,
                total_ms: 0,
                complete: completion.is_complete(),
                error_message: None,
            },
            synthesize_failure_frames: true,
        }
    }

    #[test]
    fn test_truncated_sequence_gets_failure_frames() {
        let out = output(
            vec![ResponseFrame::middle("r7", ["hi"])],
            Completion::TimedOut,
        );
        let frames = out.client_frames();

        assert_eq!(frames.len(), 3);
        match &frames[1].kind {
            ResponseKind::Res { err_no, err_msg, .. } => {
                assert_eq!(*err_no, FAILURE_ERR_NO);
                assert!(!err_msg.is_empty());
            }
            other => panic!("Expected Res, got {:?}", other),
        }
        assert_eq!(frames[2], ResponseFrame::last("r7", None));
    }

    #[test]
    fn test_failure_frames_can_be_disabled() {
        let mut out = output(vec![], Completion::StreamEnded);
        out.synthesize_failure_frames = false;
        assert!(out.client_frames().is_empty());
        assert!(matches!(
            out.incomplete_error(),
            Some(RelayError::DownstreamClosed { frames_received: 0 })
        ));
    }

    #[test]
    fn test_complete_sequence_is_encoded_unchanged() {
        let frames = vec![
            ResponseFrame::middle("r1", ["hi"]),
            ResponseFrame::last("r1", Some(AsrResult::words(["hello"]))),
        ];
        let out = output(frames.clone(), Completion::Complete);
        let wire = out.encode_for_client();

        let mut decoded = Vec::new();
        let mut buf = &wire[..];
        while let Decoded::Frame { frame, consumed } = codec::decode::<ResponseFrame>(buf).unwrap() {
            decoded.push(frame);
            buf = &buf[consumed..];
        }
        assert_eq!(decoded, frames);
        assert_eq!(out.transcript().as_deref(), Some("hello"));
    }

    #[test]
    fn test_transcript_falls_back_to_res() {
        let out = output(
            vec![
                ResponseFrame::res("r1", 0, AsrResult::words(["turn", "on"])),
                ResponseFrame::last("r1", None),
            ],
            Completion::Complete,
        );
        assert_eq!(out.transcript().as_deref(), Some("turnon"));
    }

    #[test]
    fn test_teardown_cancellation_is_not_a_problem() {
        let mut out = output(vec![ResponseFrame::last("r1", None)], Completion::Complete);
        out.download = Err(RelayError::Cancelled);
        assert!(out.problems().is_empty());

        out.upload = Err(RelayError::UpstreamIncomplete { frames_sent: 2 });
        assert_eq!(
            out.problems(),
            vec![RelayError::UpstreamIncomplete { frames_sent: 2 }]
        );
    }
}
