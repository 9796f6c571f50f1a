//! Bounded hand-off of complete utterances from the audio thread to the
//! transcription worker.
//!
//! Overflow policy is drop-newest: the audio thread never blocks, a full
//! queue rejects the new utterance and increments the overflow counter.

use crate::audio::vad::Utterance;
use crate::metrics::Metrics;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;

/// Producer end of the utterance queue, owned by the audio thread.
pub struct UtteranceQueue {
    tx: Sender<Utterance>,
    metrics: Arc<Metrics>,
}

impl UtteranceQueue {
    /// Create a queue with the given capacity; returns the producer and the
    /// worker's consumer end.
    pub fn bounded(capacity: usize, metrics: Arc<Metrics>) -> (Self, Receiver<Utterance>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx, metrics }, rx)
    }

    /// Try to enqueue. Returns false when the utterance was dropped because
    /// the queue is full (or the consumer is gone).
    pub fn push(&self, utterance: Utterance) -> bool {
        match self.tx.try_send(utterance) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.metrics.incr_queue_overflow();
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
