//! # Sync Layer
//!
//! Bridges local chain mutations and a remote copy of the same document.
//!
//! Local edits are applied optimistically; the change event they produce is
//! translated into an [`Operation`] and queued in an outbox with a sequence
//! number. The outbox is drained through a [`RemotePeer`] and trimmed by
//! acknowledgements, so delivery is at-least-once.
//!
//! Inbound operations are applied by the editor facade through the same
//! mutation entry points as local edits. [`classify`] decides beforehand
//! whether an operation still needs applying, which makes redelivery of an
//! insert, move or delete a no-op.
//!
//! The layer keeps no copy of the document: translation reads the chain.

use serde::{Deserialize, Serialize};

use crate::block::{BlockContent, BlockId, BlockType};
use crate::chain::{BlockChain, ChainError, ChangeEvent};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("structural error: {0}")]
    Structural(#[from] ChainError),
    #[error("conflicting operation on {id}: {reason}")]
    Conflict { id: BlockId, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Wire-level description of one primitive edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Operation {
    Insert {
        id: BlockId,
        block_type: BlockType,
        #[serde(default)]
        content: BlockContent,
        parent: BlockId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<BlockId>,
    },
    Update {
        id: BlockId,
        block_type: BlockType,
        #[serde(default)]
        content: BlockContent,
    },
    Move {
        id: BlockId,
        parent: BlockId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<BlockId>,
    },
    MoveRange {
        start: BlockId,
        end: BlockId,
        parent: BlockId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<BlockId>,
    },
    Delete {
        id: BlockId,
    },
}

impl Operation {
    /// Identity the operation targets (range moves report their start)
    pub fn target(&self) -> &BlockId {
        match self {
            Operation::Insert { id, .. }
            | Operation::Update { id, .. }
            | Operation::Move { id, .. }
            | Operation::Delete { id } => id,
            Operation::MoveRange { start, .. } => start,
        }
    }

    /// Build the operation that reproduces `event` on a peer.
    ///
    /// `chain` must already reflect the event. Returns `None` when the
    /// affected block can no longer be read, which only happens if events are
    /// replayed out of order.
    pub fn from_event(chain: &BlockChain, event: &ChangeEvent) -> Option<Operation> {
        let op = match event {
            ChangeEvent::Insert { block, parent } => {
                let inserted = chain.get_block(block)?;
                Operation::Insert {
                    id: block.clone(),
                    block_type: inserted.block_type,
                    content: inserted.content.clone(),
                    parent: parent.clone(),
                    after: inserted.prev().cloned(),
                }
            }
            ChangeEvent::Update { block } => {
                let updated = chain.get_block(block)?;
                Operation::Update {
                    id: block.clone(),
                    block_type: updated.block_type,
                    content: updated.content.clone(),
                }
            }
            ChangeEvent::Move { block, parent, .. } => Operation::Move {
                id: block.clone(),
                parent: parent.clone(),
                after: chain.get_block(block)?.prev().cloned(),
            },
            ChangeEvent::MoveRange {
                start, end, parent, ..
            } => Operation::MoveRange {
                start: start.clone(),
                end: end.clone(),
                parent: parent.clone(),
                after: chain.get_block(start)?.prev().cloned(),
            },
            ChangeEvent::Delete { block, .. } => Operation::Delete { id: block.clone() },
        };
        Some(op)
    }
}

/// What to do with an inbound operation given the current chain
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Apply,
    /// Target already in the requested state; skip silently
    Duplicate,
    Conflict(String),
}

/// Decide whether `op` still needs applying to `chain`
pub fn classify(chain: &BlockChain, op: &Operation) -> Disposition {
    let placed_at = |id: &BlockId, parent: &BlockId, after: &Option<BlockId>| {
        chain
            .get_block(id)
            .is_some_and(|b| b.parent() == Some(parent) && b.prev() == after.as_ref())
    };

    match op {
        // Identities are never reused: a known identity means the insert
        // already landed, even if later operations moved or removed it.
        Operation::Insert { id, .. } => {
            if chain.contains(id) || chain.was_deleted(id) {
                Disposition::Duplicate
            } else {
                Disposition::Apply
            }
        }
        Operation::Update {
            id,
            block_type,
            content,
        } => match chain.get_block(id) {
            None if chain.was_deleted(id) => Disposition::Duplicate,
            None => Disposition::Conflict(format!("{id} does not exist")),
            Some(b) if b.block_type == *block_type && b.content == *content => {
                Disposition::Duplicate
            }
            Some(_) => Disposition::Apply,
        },
        Operation::Move { id, parent, after } => {
            if chain.was_deleted(id) {
                Disposition::Duplicate
            } else if !chain.contains(id) {
                Disposition::Conflict(format!("{id} does not exist"))
            } else if placed_at(id, parent, after) {
                Disposition::Duplicate
            } else {
                Disposition::Apply
            }
        }
        Operation::MoveRange {
            start,
            end,
            parent,
            after,
        } => {
            if chain.was_deleted(start) || chain.was_deleted(end) {
                Disposition::Duplicate
            } else if !chain.contains(start) || !chain.contains(end) {
                Disposition::Conflict(format!("range {start}..{end} no longer exists"))
            } else if placed_at(start, parent, after)
                && chain.get_block(end).and_then(|b| b.parent()) == Some(parent)
            {
                Disposition::Duplicate
            } else {
                Disposition::Apply
            }
        }
        Operation::Delete { id } => {
            if chain.contains(id) {
                Disposition::Apply
            } else {
                Disposition::Duplicate
            }
        }
    }
}

/// One queued operation awaiting acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    pub seq: u64,
    pub op: Operation,
}

/// Transport seam: how queued operations physically reach the peer
pub trait RemotePeer {
    fn send(&mut self, batch: &[Outbound]) -> Result<(), SyncError>;
}

pub struct SyncLayer {
    outbox: Vec<Outbound>,
    next_seq: u64,
    batch_size: usize,
    applying_remote: bool,
    /// Highest peer sequence number applied so far
    last_received: Option<u64>,
}

impl Default for SyncLayer {
    fn default() -> Self {
        Self::new(64)
    }
}

impl SyncLayer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            outbox: Vec::new(),
            next_seq: 1,
            batch_size: batch_size.max(1),
            applying_remote: false,
            last_received: None,
        }
    }

    /// Queue the operation for a locally produced event.
    ///
    /// Events caused by a remote operation are not echoed back.
    pub fn on_local_change(&mut self, chain: &BlockChain, event: &ChangeEvent) {
        if self.applying_remote {
            return;
        }
        match Operation::from_event(chain, event) {
            Some(op) => {
                self.enqueue(op);
            }
            None => log::error!("cannot translate {event:?}: block missing from chain"),
        }
    }

    pub fn enqueue(&mut self, op: Operation) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        log::debug!("queued #{seq}: {op:?}");
        self.outbox.push(Outbound { seq, op });
        seq
    }

    pub fn begin_remote(&mut self) {
        self.applying_remote = true;
    }

    pub fn end_remote(&mut self) {
        self.applying_remote = false;
    }

    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote
    }

    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    pub fn outbox(&self) -> &[Outbound] {
        &self.outbox
    }

    /// Hand the oldest unacknowledged operations to `peer`.
    ///
    /// Nothing leaves the outbox here; only [`SyncLayer::acknowledge`] trims it.
    pub fn flush(&mut self, peer: &mut dyn RemotePeer) -> Result<usize, SyncError> {
        let count = self.outbox.len().min(self.batch_size);
        if count == 0 {
            return Ok(0);
        }
        if let Err(err) = peer.send(&self.outbox[..count]) {
            log::warn!("flush of {count} operations failed: {err}");
            return Err(err);
        }
        log::debug!("flushed {count} operations");
        Ok(count)
    }

    /// Drop every queued operation up to and including `seq`
    pub fn acknowledge(&mut self, seq: u64) -> usize {
        let before = self.outbox.len();
        self.outbox.retain(|outbound| outbound.seq > seq);
        before - self.outbox.len()
    }

    /// Whether an inbound sequence number was already applied
    pub fn already_received(&self, seq: u64) -> bool {
        self.last_received.is_some_and(|last| seq <= last)
    }

    pub fn mark_received(&mut self, seq: u64) {
        self.last_received = Some(self.last_received.map_or(seq, |last| last.max(seq)));
    }

    pub fn last_received(&self) -> Option<u64> {
        self.last_received
    }

    /// Forget all queued work (document switch)
    pub fn reset(&mut self) {
        self.outbox.clear();
        self.applying_remote = false;
        self.last_received = None;
    }
}
