//! Coordinator state for replicated operations within a partition. Each
//! entry lives in a kvs daemon's state table, broadcasts raw operations to
//! the partition's replicas, aggregates their answers, and responds to the
//! transaction manager exactly once. Outstanding raw requests resend on an
//! interval; a configurable deadline turns an unreachable partition into a
//! definitive failure.

pub mod lock;
pub mod read;
pub mod write;

use std::time::Duration;

/// How often unanswered raw requests are resent.
pub const RESEND_INTERVAL: Duration = Duration::from_secs(1);

/// How long a replicated operation may go undecided before it fails.
pub const REPLICATE_DEADLINE: Duration = Duration::from_secs(30);

/// A strict majority of the replica set.
pub(crate) fn majority(replicas: usize) -> usize {
    replicas / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_is_a_strict_majority() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }
}
