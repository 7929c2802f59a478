//! Per-utterance session state
//!
//! A session owns the two queues that connect the relay's tasks:
//! outbound (client → upstream driver) and inbound (downstream decoder →
//! dispatcher). Each queue end can be taken exactly once.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::RelayError;
use crate::dialog::DialogIdentity;
use crate::protocol::{ApiParam, RequestFrame, ResponseFrame};

/// Outbound queue depth. Producers wait once this many frames are unsent.
const OUTBOUND_CAPACITY: usize = 100;

pub struct Session {
    id: String,
    identity: DialogIdentity,
    sender: RequestSender,
    outbound_rx: Option<mpsc::Receiver<RequestFrame>>,
    inbound_tx: Option<mpsc::UnboundedSender<ResponseFrame>>,
    inbound_rx: Option<mpsc::UnboundedReceiver<ResponseFrame>>,
    cancel: CancellationToken,
    opened_at: Instant,
}

impl Session {
    pub fn new(identity: DialogIdentity) -> Self {
        Self::with_id(Uuid::new_v4().simple().to_string(), identity)
    }

    pub fn with_id(id: impl Into<String>, identity: DialogIdentity) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            id: id.into(),
            identity,
            sender: RequestSender::new(outbound_tx),
            outbound_rx: Some(outbound_rx),
            inbound_tx: Some(inbound_tx),
            inbound_rx: Some(inbound_rx),
            cancel: CancellationToken::new(),
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &DialogIdentity {
        &self.identity
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Handle for queuing outbound frames; clone freely
    pub fn sender(&self) -> RequestSender {
        self.sender.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Abort every blocking wait in this session
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Take the outbound receiver (can only be called once)
    pub fn take_outbound_receiver(&mut self) -> Option<mpsc::Receiver<RequestFrame>> {
        self.outbound_rx.take()
    }

    /// Take the inbound sender (can only be called once)
    pub fn take_inbound_sender(&mut self) -> Option<mpsc::UnboundedSender<ResponseFrame>> {
        self.inbound_tx.take()
    }

    /// Take the inbound receiver (can only be called once)
    pub fn take_inbound_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ResponseFrame>> {
        self.inbound_rx.take()
    }
}

/// Outbound queue producer that enforces a single trailing terminal marker.
#[derive(Clone)]
pub struct RequestSender {
    tx: mpsc::Sender<RequestFrame>,
    /// Set once LAST or CANCEL has been queued. Held across the send so
    /// concurrent producers cannot slip a frame in behind the marker.
    closed: Arc<Mutex<bool>>,
}

impl RequestSender {
    fn new(tx: mpsc::Sender<RequestFrame>) -> Self {
        Self {
            tx,
            closed: Arc::new(Mutex::new(false)),
        }
    }

    pub async fn send(&self, frame: RequestFrame) -> Result<(), RelayError> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Err(RelayError::UploadClosed);
        }
        let terminal = frame.is_terminal();
        self.tx
            .send(frame)
            .await
            .map_err(|_| RelayError::UploadClosed)?;
        if terminal {
            *closed = true;
        }
        Ok(())
    }

    pub async fn send_all(
        &self,
        frames: impl IntoIterator<Item = RequestFrame>,
    ) -> Result<(), RelayError> {
        for frame in frames {
            self.send(frame).await?;
        }
        Ok(())
    }

    pub async fn auth(&self, param: ApiParam) -> Result<(), RelayError> {
        self.send(RequestFrame::Auth(param)).await
    }

    /// Queue `audio` as DATA frames of `block_size` bytes
    pub async fn push_audio(&self, audio: &[u8], block_size: usize) -> Result<(), RelayError> {
        self.send_all(RequestFrame::data_blocks(audio, block_size))
            .await
    }

    /// Queue LAST
    pub async fn finish(&self) -> Result<(), RelayError> {
        self.send(RequestFrame::Last).await
    }

    /// Queue CANCEL. This only tells the backend to stop; local tasks keep
    /// running until the session's token is cancelled.
    pub async fn cancel_upload(&self) -> Result<(), RelayError> {
        self.send(RequestFrame::Cancel).await
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.lock().await
    }
}
