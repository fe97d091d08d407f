//! Receive-line reconciliation for subscriber sessions.

use crate::error::{VoiceError, VoiceResult};

/// Tracks how many receive-only audio lines exist versus how many the server
/// says are needed (one per concurrently active publisher). Lines are added
/// before an offer is generated so a single negotiation round covers all
/// current publishers.
#[derive(Debug, Default)]
pub struct TransceiverAllocator {
    desired: u32,
    provisioned: u32,
}

impl TransceiverAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the authoritative count and return how many lines to add.
    ///
    /// Zero is a no-op (no renegotiation needed). A desired count below the
    /// provisioned count means the server bookkeeping is broken; that is
    /// reported, never clamped.
    pub fn reconcile(&mut self, desired: u32) -> VoiceResult<u32> {
        if desired < self.provisioned {
            return Err(VoiceError::AllocatorInvariant {
                desired,
                provisioned: self.provisioned,
            });
        }
        self.desired = desired;
        Ok(desired - self.provisioned)
    }

    /// Record that `added` lines now exist on the peer connection.
    pub fn mark_provisioned(&mut self, added: u32) {
        self.provisioned += added;
        debug_assert!(self.provisioned <= self.desired);
    }

    pub fn desired(&self) -> u32 {
        self.desired
    }

    pub fn provisioned(&self) -> u32 {
        self.provisioned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoiceError;

    #[test]
    fn reconcile_returns_the_missing_delta() {
        let mut allocator = TransceiverAllocator::new();
        assert_eq!(allocator.reconcile(3).expect("delta"), 3);
        allocator.mark_provisioned(3);
        assert_eq!(allocator.provisioned(), 3);

        // Two more publishers joined.
        assert_eq!(allocator.reconcile(5).expect("delta"), 2);
        allocator.mark_provisioned(2);
        assert_eq!(allocator.provisioned(), 5);
    }

    #[test]
    fn equal_counts_are_a_no_op() {
        let mut allocator = TransceiverAllocator::new();
        allocator.reconcile(2).expect("delta");
        allocator.mark_provisioned(2);
        assert_eq!(allocator.reconcile(2).expect("delta"), 0);
    }

    #[test]
    fn shrinking_desired_is_reported_not_clamped() {
        let mut allocator = TransceiverAllocator::new();
        allocator.reconcile(4).expect("delta");
        allocator.mark_provisioned(4);
        match allocator.reconcile(2) {
            Err(VoiceError::AllocatorInvariant {
                desired,
                provisioned,
            }) => {
                assert_eq!(desired, 2);
                assert_eq!(provisioned, 4);
            }
            other => panic!("expected invariant violation, got {other:?}"),
        }
        // State is untouched by the rejected reconcile.
        assert_eq!(allocator.provisioned(), 4);
    }
}
