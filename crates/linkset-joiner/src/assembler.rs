//! Link identifier allocation

use linkset_common::{LinkRecord, ResolutionResult};
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out link ids from a seed in the order results arrive
#[derive(Debug)]
pub struct LinkAssembler {
    next_id: AtomicU64,
}

impl LinkAssembler {
    pub fn new(seed: u64) -> Self {
        Self {
            next_id: AtomicU64::new(seed),
        }
    }

    /// Id the next assembled record will receive
    pub fn peek(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn assemble(&self, result: ResolutionResult) -> LinkRecord {
        let link_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        LinkRecord {
            link_id,
            source_id: result.source_id,
            reference_id: result.reference_id.unwrap_or_default(),
        }
    }
}
