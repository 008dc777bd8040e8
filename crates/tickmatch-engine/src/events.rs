//! Event sequencing and ring-buffer fan-out.
//!
//! Every event a symbol engine emits is sealed with a contiguous
//! per-symbol sequence number and a wall-clock timestamp, then fanned
//! out to bounded per-consumer rings:
//!
//! - the **audit** consumer is mandatory — if its ring fills, the symbol
//!   halts rather than lose an auditable event;
//! - **feed** consumers (market data) are best-effort — a full ring
//!   drops the consumer, not the producer.

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tickmatch_types::{
    EngineError, EngineEvent, Result, SequencedEvent, Symbol,
};
use tracing::warn;

/// Assigns contiguous sequence numbers starting from 0.
#[derive(Debug)]
pub struct EventSequencer {
    symbol: Symbol,
    next_seq: u64,
}

impl EventSequencer {
    #[must_use]
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            next_seq: 0,
        }
    }

    /// Seal an event into the stream, consuming the next sequence number.
    pub fn seal(&mut self, event: EngineEvent) -> SequencedEvent {
        let seq = self.next_seq;
        self.next_seq += 1;
        SequencedEvent {
            symbol: self.symbol.clone(),
            seq,
            ts: Utc::now(),
            event,
        }
    }

    /// The sequence number the next event will take.
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

struct Feed {
    name: String,
    sender: Sender<SequencedEvent>,
}

/// Fan-out of sealed events to bounded consumer rings.
pub struct EventBus {
    symbol: Symbol,
    audit: Sender<SequencedEvent>,
    feeds: Vec<Feed>,
    ring_depth: usize,
}

impl EventBus {
    /// Create the bus and the mandatory audit receiver.
    #[must_use]
    pub fn new(symbol: Symbol, ring_depth: usize) -> (Self, Receiver<SequencedEvent>) {
        let (audit, audit_rx) = bounded(ring_depth);
        (
            Self {
                symbol,
                audit,
                feeds: Vec::new(),
                ring_depth,
            },
            audit_rx,
        )
    }

    /// Attach a best-effort feed consumer.
    pub fn subscribe(&mut self, name: impl Into<String>) -> Receiver<SequencedEvent> {
        let (tx, rx) = bounded(self.ring_depth);
        self.feeds.push(Feed {
            name: name.into(),
            sender: tx,
        });
        rx
    }

    /// Publish one sealed event to every consumer.
    ///
    /// # Errors
    /// [`EngineError::AuditBackpressure`] when the audit ring is full or
    /// its consumer is gone — the caller must halt the symbol.
    pub fn publish(&mut self, event: &SequencedEvent) -> Result<()> {
        if self.audit.try_send(event.clone()).is_err() {
            return Err(EngineError::AuditBackpressure {
                symbol: self.symbol.to_string(),
            });
        }
        self.feeds.retain(|feed| {
            match feed.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    warn!(symbol = %self.symbol, feed = %feed.name, "dropping slow feed consumer");
                    false
                }
            }
        });
        Ok(())
    }

    /// Number of live best-effort consumers.
    #[must_use]
    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }
}
