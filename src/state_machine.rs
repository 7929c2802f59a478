//! Response dispatcher state machine
//!
//! All transitions go through the `reduce()` function, which returns a new
//! state and a list of effects for the dispatcher loop to execute. The reducer
//! never touches queues, timers or the augmentor; it only decides.
//!
//! ```text
//! Await --clean RES--> Augmenting --LAST--> Done
//!   \________________________LAST________/
//! ```

use crate::protocol::{ResponseFrame, ResponseKind};

/// Why the dispatcher stopped consuming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// LAST frame seen and emitted
    Complete,
    /// Inbound queue idle for a full poll window without LAST
    TimedOut,
    /// Inbound queue closed (download ended) without LAST
    StreamEnded,
    /// Session cancelled before LAST
    Cancelled,
}

impl Completion {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completion::Complete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Completion::Complete => "complete",
            Completion::TimedOut => "timed_out",
            Completion::StreamEnded => "stream_ended",
            Completion::Cancelled => "cancelled",
        }
    }
}

/// Dispatcher state. Authoritative; only changed by the reducer.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum State {
    #[default]
    Await,
    /// A dialog call for `utterance` is outstanding
    Augmenting { utterance: String },
    Done { completion: Completion },
}

/// Inputs to the reducer, produced by polling the inbound queue
#[derive(Debug, Clone)]
pub enum Event {
    Frame(ResponseFrame),
    /// No frame within the poll window
    PollTimeout,
    /// Every producer of the inbound queue is gone
    QueueClosed,
    Cancelled,
}

/// Work for the dispatcher loop
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Append the frame to the output unchanged
    Emit(ResponseFrame),
    /// Submit the utterance to the augmentor and retain the handle
    StartAugmentation { utterance: String },
    /// Wait (bounded) on the retained handle, stitch the result into this
    /// LAST frame, then append it
    StitchAndEmit(ResponseFrame),
    /// Drop the retained handle without waiting
    AbandonAugmentation,
    Finish(Completion),
}

/// Which interim frame types reach the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub forward_middle: bool,
    pub forward_third: bool,
    pub forward_heart: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            forward_middle: true,
            forward_third: false,
            forward_heart: false,
        }
    }
}

impl DispatchPolicy {
    /// Forward every interim frame
    pub fn forward_all() -> Self {
        Self {
            forward_middle: true,
            forward_third: true,
            forward_heart: true,
        }
    }

    fn forwards(&self, kind: &ResponseKind) -> bool {
        match kind {
            ResponseKind::Middle(_) => self.forward_middle,
            ResponseKind::Third(_) => self.forward_third,
            ResponseKind::Heart => self.forward_heart,
            ResponseKind::Res { .. } | ResponseKind::Last { .. } => true,
        }
    }
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Done ignores everything
/// - Only the first clean RES starts augmentation; later RES frames pass through
/// - LAST always ends the sequence, stitching only when augmentation is outstanding
/// - Ending without LAST abandons any outstanding augmentation
pub fn reduce(state: &State, event: Event, policy: &DispatchPolicy) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    match (state, event) {
        (Done { .. }, _) => (state.clone(), vec![]),

        // -----------------
        // Frames
        // -----------------
        (_, Frame(frame)) => match &frame.kind {
            ResponseKind::Middle(_) | ResponseKind::Third(_) | ResponseKind::Heart => {
                let effects = if policy.forwards(&frame.kind) {
                    vec![Emit(frame)]
                } else {
                    vec![]
                };
                (state.clone(), effects)
            }
            ResponseKind::Res { .. } => match (state, frame.clean_utterance()) {
                (Await, Some(utterance)) => (
                    Augmenting {
                        utterance: utterance.clone(),
                    },
                    vec![Emit(frame), StartAugmentation { utterance }],
                ),
                // Unclean, or a second RES while augmenting
                _ => (state.clone(), vec![Emit(frame)]),
            },
            ResponseKind::Last { .. } => {
                let done = Done {
                    completion: Completion::Complete,
                };
                let emit = match state {
                    Augmenting { .. } => StitchAndEmit(frame),
                    _ => Emit(frame),
                };
                (done, vec![emit, Finish(Completion::Complete)])
            }
        },

        // -----------------
        // Early endings
        // -----------------
        (_, PollTimeout) => end_early(state, Completion::TimedOut),
        (_, QueueClosed) => end_early(state, Completion::StreamEnded),
        (_, Cancelled) => end_early(state, Completion::Cancelled),
    }
}

fn end_early(state: &State, completion: Completion) -> (State, Vec<Effect>) {
    let mut effects = Vec::with_capacity(2);
    if matches!(state, State::Augmenting { .. }) {
        effects.push(Effect::AbandonAugmentation);
    }
    effects.push(Effect::Finish(completion));
    (State::Done { completion }, effects)
}
