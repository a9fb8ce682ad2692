//! Cache transactions.

use crate::buf::AccessMode;
use crate::page_map::BufSlot;
use nimbus_common::{Result, VersionId};

/// Identifier of one live transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId(pub u64);

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Commit lifecycle.
///
/// `acquire` and `allocate` are valid only in `Open`. `commit` moves to
/// `InCommit`, write-back acceptance moves to `Committing`, and the sync
/// completion moves to `Committed` and fires the commit callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnState {
    Open,
    InCommit,
    Committing,
    Committed,
}

/// Callback fired exactly once when a commit completes or fails.
pub type CommitCallback = Box<dyn FnOnce(Result<()>)>;

pub(crate) struct Transaction {
    pub id: TxnId,
    pub access: AccessMode,
    pub state: TxnState,
    pub snapshotted: bool,
    /// For a snapshotted read transaction: the registered snapshot
    /// version. For a write transaction: the version its writes stamp
    /// onto blocks, allocated at begin.
    pub version: VersionId,
    /// Snapshot images this transaction owns a reference on, as
    /// (slot, captured version) pairs.
    pub owned_snapshots: Vec<(BufSlot, VersionId)>,
    pub commit_callback: Option<CommitCallback>,
    /// True once the transaction mutated, allocated, or deleted a block.
    pub made_changes: bool,
    /// Handles acquired and not yet released.
    pub live_handles: usize,
    /// Acquires queued on a buffer lock and not yet granted.
    pub pending_acquires: usize,
    /// Enforces the documented ascending block-id order for write
    /// acquisitions within one transaction.
    #[cfg(debug_assertions)]
    pub last_write_block: Option<nimbus_common::BlockId>,
}

impl Transaction {
    pub fn new(id: TxnId, access: AccessMode, version: VersionId) -> Self {
        debug_assert!(matches!(access, AccessMode::Read | AccessMode::Write));
        Self {
            id,
            access,
            state: TxnState::Open,
            snapshotted: false,
            version,
            owned_snapshots: Vec::new(),
            commit_callback: None,
            made_changes: false,
            live_handles: 0,
            pending_acquires: 0,
            #[cfg(debug_assertions)]
            last_write_block: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == TxnState::Open
    }
}
