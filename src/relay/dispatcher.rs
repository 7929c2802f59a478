//! Response dispatcher
//!
//! Polls the inbound queue, feeds each event through [`reduce`], and executes
//! the resulting effects. The only waits are the bounded queue poll and the
//! bounded rendezvous with a pending augmentation at the LAST frame; both
//! also end early when the session is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::pool::WorkerPool;
use super::session::Session;
use super::RelayError;
use crate::dialog::{AugmentRequest, Augmentor, DialogIdentity};
use crate::protocol::ResponseFrame;
use crate::settings::RelaySettings;
use crate::state_machine::{reduce, Completion, DispatchPolicy, Effect, Event, State};

/// What happened to augmentation in one session
#[derive(Debug, Clone, PartialEq)]
pub enum AugmentationOutcome {
    /// No clean RES frame was seen
    NotAttempted,
    /// The LAST frame carries this text
    Applied { text: String, latency: Duration },
    /// Timed out, failed, or came back empty; LAST passed through unchanged
    Unavailable { reason: String, latency: Duration },
    /// Dropped without waiting because the sequence ended without LAST or
    /// the session was cancelled
    Abandoned { reason: String },
}

impl AugmentationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AugmentationOutcome::NotAttempted => "not_attempted",
            AugmentationOutcome::Applied { .. } => "applied",
            AugmentationOutcome::Unavailable { .. } => "unavailable",
            AugmentationOutcome::Abandoned { .. } => "abandoned",
        }
    }

    pub fn latency(&self) -> Option<Duration> {
        match self {
            AugmentationOutcome::Applied { latency, .. }
            | AugmentationOutcome::Unavailable { latency, .. } => Some(*latency),
            _ => None,
        }
    }

    /// The non-fatal error this outcome corresponds to, if any
    pub fn as_error(&self) -> Option<RelayError> {
        match self {
            AugmentationOutcome::Unavailable { reason, .. }
            | AugmentationOutcome::Abandoned { reason } => {
                Some(RelayError::AugmentationUnavailable(reason.clone()))
            }
            _ => None,
        }
    }
}

/// In-flight augmentation. Dropping it aborts the task.
pub struct PendingAugmentation {
    handle: JoinHandle<Option<String>>,
    /// Fires once the task holds a pool permit
    running: oneshot::Receiver<()>,
    started_at: Instant,
}

impl PendingAugmentation {
    pub fn spawn(pool: &WorkerPool, augmentor: Arc<dyn Augmentor>, request: AugmentRequest) -> Self {
        let (running_tx, running) = oneshot::channel();
        let future = augmentor.augment(request);
        let handle = pool.spawn(async move {
            let _ = running_tx.send(());
            future.await
        });
        Self {
            handle,
            running,
            started_at: Instant::now(),
        }
    }

    /// Wait up to `wait` for the result, counted from when the task got a
    /// pool permit. Empty text counts as no augmentation.
    pub async fn resolve(mut self, wait: Duration, cancel: &CancellationToken) -> AugmentationOutcome {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return AugmentationOutcome::Abandoned {
                    reason: "session cancelled".to_string(),
                };
            }
            joined = async {
                // An error here means the task is gone; the join reports why
                let _ = (&mut self.running).await;
                timeout(wait, &mut self.handle).await
            } => joined,
        };
        let latency = self.started_at.elapsed();

        match joined {
            Ok(Ok(Some(text))) if !text.trim().is_empty() => {
                AugmentationOutcome::Applied { text, latency }
            }
            Ok(Ok(_)) => AugmentationOutcome::Unavailable {
                reason: "no augmentation".to_string(),
                latency,
            },
            Ok(Err(e)) => AugmentationOutcome::Unavailable {
                reason: format!("augmentation task failed: {}", e),
                latency,
            },
            Err(_) => AugmentationOutcome::Unavailable {
                reason: format!("timed out after {:?}", wait),
                latency,
            },
        }
    }

    pub fn abandon(self, reason: impl Into<String>) -> AugmentationOutcome {
        self.handle.abort();
        AugmentationOutcome::Abandoned {
            reason: reason.into(),
        }
    }
}

impl Drop for PendingAugmentation {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Result of one dispatch run
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// Output sequence, in emission order
    pub frames: Vec<ResponseFrame>,
    pub completion: Completion,
    pub augmentation: AugmentationOutcome,
    /// Frames taken off the inbound queue, forwarded or not
    pub frames_received: usize,
}

impl DispatchOutcome {
    /// The error describing a sequence that ended without LAST
    pub fn incomplete_error(&self) -> Option<RelayError> {
        incomplete_error(self.completion, self.frames_received)
    }
}

pub(crate) fn incomplete_error(completion: Completion, frames_received: usize) -> Option<RelayError> {
    match completion {
        Completion::Complete => None,
        Completion::TimedOut => Some(RelayError::DownstreamTimeout { frames_received }),
        Completion::StreamEnded => Some(RelayError::DownstreamClosed { frames_received }),
        Completion::Cancelled => Some(RelayError::Cancelled),
    }
}

pub struct Dispatcher {
    session_id: String,
    identity: DialogIdentity,
    policy: DispatchPolicy,
    poll_timeout: Duration,
    augment_timeout: Duration,
    augmentor: Arc<dyn Augmentor>,
    pool: WorkerPool,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        session: &Session,
        augmentor: Arc<dyn Augmentor>,
        pool: WorkerPool,
        settings: &RelaySettings,
    ) -> Self {
        Self {
            session_id: session.id().to_string(),
            identity: session.identity().clone(),
            policy: settings.dispatch_policy(),
            poll_timeout: settings.poll_timeout(),
            augment_timeout: settings.augment_timeout(),
            augmentor,
            pool,
            cancel: session.cancel_token(),
        }
    }

    async fn next_event(&self, rx: &mut mpsc::UnboundedReceiver<ResponseFrame>) -> Event {
        // Cancelling the session also stops the decoder, which closes the
        // queue; the cancellation must win over that close.
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Event::Cancelled,
            polled = timeout(self.poll_timeout, rx.recv()) => match polled {
                Ok(Some(frame)) => Event::Frame(frame),
                Ok(None) if self.cancel.is_cancelled() => Event::Cancelled,
                Ok(None) => Event::QueueClosed,
                Err(_) => Event::PollTimeout,
            },
        }
    }

    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<ResponseFrame>) -> DispatchOutcome {
        let mut state = State::default();
        let mut pending: Option<PendingAugmentation> = None;
        let mut outcome = DispatchOutcome {
            frames: Vec::new(),
            completion: Completion::Complete,
            augmentation: AugmentationOutcome::NotAttempted,
            frames_received: 0,
        };

        log::info!("Dispatcher[{}]: started", self.session_id);

        while !matches!(state, State::Done { .. }) {
            let event = self.next_event(&mut rx).await;
            if matches!(event, Event::Frame(_)) {
                outcome.frames_received += 1;
            }

            let old_discriminant = std::mem::discriminant(&state);
            let (next, effects) = reduce(&state, event, &self.policy);
            if old_discriminant != std::mem::discriminant(&next) {
                log::info!(
                    "Dispatcher[{}]: {:?} -> {:?}",
                    self.session_id,
                    state,
                    next
                );
            }
            state = next;

            for effect in effects {
                match effect {
                    Effect::Emit(frame) => outcome.frames.push(frame),
                    Effect::StartAugmentation { utterance } => {
                        log::info!(
                            "Dispatcher[{}]: augmenting {:?}",
                            self.session_id,
                            utterance
                        );
                        let request = AugmentRequest {
                            session_id: self.session_id.clone(),
                            identity: self.identity.clone(),
                            utterance,
                        };
                        pending = Some(PendingAugmentation::spawn(
                            &self.pool,
                            Arc::clone(&self.augmentor),
                            request,
                        ));
                    }
                    Effect::StitchAndEmit(mut last) => {
                        if let Some(handle) = pending.take() {
                            let resolved = handle.resolve(self.augment_timeout, &self.cancel).await;
                            match &resolved {
                                AugmentationOutcome::Applied { text, latency } => {
                                    log::info!(
                                        "Dispatcher[{}]: augmentation applied after {:?}",
                                        self.session_id,
                                        latency
                                    );
                                    last.replace_last_result(text.clone());
                                }
                                other => {
                                    if let Some(e) = other.as_error() {
                                        log::warn!("Dispatcher[{}]: {}", self.session_id, e);
                                    }
                                }
                            }
                            outcome.augmentation = resolved;
                        }
                        outcome.frames.push(last);
                    }
                    Effect::AbandonAugmentation => {
                        if let Some(handle) = pending.take() {
                            log::warn!(
                                "Dispatcher[{}]: abandoning augmentation, sequence ended without LAST",
                                self.session_id
                            );
                            outcome.augmentation = handle.abandon("sequence ended without LAST");
                        }
                    }
                    Effect::Finish(completion) => outcome.completion = completion,
                }
            }
        }

        log::info!(
            "Dispatcher[{}]: finished ({}, {} frames out, augmentation {})",
            self.session_id,
            outcome.completion.as_str(),
            outcome.frames.len(),
            outcome.augmentation.as_str()
        );
        outcome
    }
}
