//! Pending-operation table of one connection.
//!
//! An operation leaves the table exactly once: whichever path removes it
//! (response, error frame, reset) owns its completion.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::call::{IncomingResponse, RequestObserver, ResponseChunk};
use crate::errors::ChannelError;
use crate::observability::Span;

/// Stat tags of one outbound call.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallTags {
    pub service: String,
    pub target_service: String,
    pub target_endpoint: String,
}

pub(crate) enum OutStage {
    /// Waiting for the first response frame.
    Awaiting(oneshot::Sender<Result<IncomingResponse, ChannelError>>),
    /// Response surfaced; continuations go to the caller's channel.
    Streaming(mpsc::UnboundedSender<ResponseChunk>),
}

pub(crate) struct OutOperation {
    pub started_ms: u64,
    pub deadline_ms: u64,
    pub tags: CallTags,
    pub observer: Option<Arc<dyn RequestObserver>>,
    pub span: Option<Span>,
    pub stage: OutStage,
}

#[derive(Default)]
pub(crate) struct Operations {
    next_id: u32,
    out: HashMap<u32, OutOperation>,
    pings: HashMap<u32, oneshot::Sender<()>>,
}

impl Operations {
    /// Ids start at 1 and wrap, skipping any still in use.
    pub fn next_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0
                && !self.out.contains_key(&self.next_id)
                && !self.pings.contains_key(&self.next_id)
            {
                return self.next_id;
            }
        }
    }

    pub fn add_out(&mut self, id: u32, op: OutOperation) {
        self.out.insert(id, op);
    }

    pub fn out_mut(&mut self, id: u32) -> Option<&mut OutOperation> {
        self.out.get_mut(&id)
    }

    pub fn pop_out(&mut self, id: u32) -> Option<OutOperation> {
        self.out.remove(&id)
    }

    pub fn add_ping(&mut self, id: u32, waiter: oneshot::Sender<()>) {
        self.pings.insert(id, waiter);
    }

    pub fn pop_ping(&mut self, id: u32) -> Option<oneshot::Sender<()>> {
        self.pings.remove(&id)
    }

    pub fn pending_out(&self) -> usize {
        self.out.len()
    }

    /// First operation whose deadline has passed, with its age.
    pub fn first_expired(&self, now_ms: u64) -> Option<(u32, u64)> {
        self.out
            .iter()
            .filter(|(_, op)| op.deadline_ms <= now_ms)
            .min_by_key(|(id, _)| **id)
            .map(|(id, op)| (*id, now_ms.saturating_sub(op.started_ms)))
    }

    /// Remove everything; used by reset.
    pub fn drain(&mut self) -> (Vec<(u32, OutOperation)>, Vec<oneshot::Sender<()>>) {
        let mut out: Vec<_> = self.out.drain().collect();
        out.sort_by_key(|(id, _)| *id);
        let pings = self.pings.drain().map(|(_, tx)| tx).collect();
        (out, pings)
    }
}
