//! Outbound request queue.
use std::mem;

use crate::models::{RequestBatch, ServiceRequest};

/// Pending requests with monotonic id assignment.
///
/// Ids start at 0 and are never reused for the life of the queue, across
/// reconnects included. The pending list is drained by swapping it out
/// whole, so a batch is exactly the requests pushed since the last drain.
#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: Vec<ServiceRequest>,
    next_id: u64,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next id to `request` without queueing it.
    pub fn assign_id(&mut self, request: &mut ServiceRequest) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        request.request_id = id;
        id
    }

    /// Assign the next id and append. Returns the id.
    pub fn push(&mut self, mut request: ServiceRequest) -> u64 {
        let id = self.assign_id(&mut request);
        self.pending.push(request);
        id
    }

    /// Take every pending request as one batch, or `None` if there are none.
    pub fn drain(&mut self) -> Option<RequestBatch> {
        if self.pending.is_empty() {
            return None;
        }
        Some(RequestBatch {
            requests: mem::take(&mut self.pending),
        })
    }

    /// Requests waiting for the next flush, in order.
    pub fn pending(&self) -> impl Iterator<Item = &ServiceRequest> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The id the next request will receive.
    pub fn peek_next_id(&self) -> u64 {
        self.next_id
    }
}
