//! Downstream decoder
//!
//! Reassembles response frames from the ASR download connection and publishes
//! them onto the session's inbound queue in arrival order. A chunk that fails
//! to decode is logged and dropped; the stream keeps going.

use std::fmt;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::RelayError;
use crate::protocol::{FrameAssembler, ResponseFrame};

/// Counters for one download
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub chunks: usize,
    pub bytes: u64,
    pub frames: usize,
    pub dropped_chunks: usize,
}

pub struct DownstreamDecoder {
    session_id: String,
    assembler: FrameAssembler,
    tx: mpsc::UnboundedSender<ResponseFrame>,
    stats: DecodeStats,
}

impl DownstreamDecoder {
    pub fn new(
        session_id: impl Into<String>,
        tx: mpsc::UnboundedSender<ResponseFrame>,
        max_frame_len: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            assembler: FrameAssembler::with_limit(max_frame_len),
            tx,
            stats: DecodeStats::default(),
        }
    }

    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    /// Feed one chunk. Returns how many frames it completed.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> usize {
        self.stats.chunks += 1;
        self.stats.bytes += chunk.len() as u64;

        let buffered = self.assembler.buffered();
        let mut frames = Vec::new();
        if let Err(e) = self.assembler.push::<ResponseFrame>(chunk, &mut frames) {
            self.stats.dropped_chunks += 1;
            log::warn!(
                "Downstream[{}]: dropping chunk of {} bytes ({} previously buffered): {}",
                self.session_id,
                chunk.len(),
                buffered,
                e
            );
        }

        let decoded = frames.len();
        for frame in frames {
            log::debug!(
                "Downstream[{}]: {:?} frame",
                self.session_id,
                frame.response_type()
            );
            if self.tx.send(frame).is_err() {
                log::debug!("Downstream[{}]: inbound queue closed", self.session_id);
                break;
            }
        }
        self.stats.frames += decoded;
        decoded
    }

    /// Consume the download stream until it ends, fails, or the session is
    /// cancelled. The inbound sender is dropped on return, which the
    /// dispatcher sees as the queue closing.
    pub async fn pump<S, E>(
        mut self,
        mut stream: S,
        cancel: CancellationToken,
    ) -> Result<DecodeStats, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: fmt::Display,
    {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Downstream[{}]: cancelled", self.session_id);
                    return Err(RelayError::Cancelled);
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    self.on_chunk(&chunk);
                    if self.tx.is_closed() {
                        // Dispatcher is done; nothing left to deliver to
                        return Ok(self.stats);
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Downstream[{}]: download failed: {}", self.session_id, e);
                    return Err(RelayError::DownloadFailed(e.to_string()));
                }
                None => {
                    if self.assembler.buffered() > 0 {
                        log::warn!(
                            "Downstream[{}]: stream ended with {} bytes of a partial frame",
                            self.session_id,
                            self.assembler.buffered()
                        );
                    }
                    log::info!(
                        "Downstream[{}]: download complete ({} chunks, {} frames, {} dropped)",
                        self.session_id,
                        self.stats.chunks,
                        self.stats.frames,
                        self.stats.dropped_chunks
                    );
                    return Ok(self.stats);
                }
            }
        }
    }
}
