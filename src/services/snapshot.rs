use crate::client::FermenterClient;
use crate::error::SyncError;
use crate::models::fermentation::BatchStatusSnapshot;

/// Source of full dashboard snapshots.
///
/// One idempotent call returning every non-terminal batch. Implementations hold no sync state;
/// every failure comes back as a value.
pub trait SnapshotSource: Send + Sync + 'static {
    fn fetch_snapshots(&self) -> Result<Vec<BatchStatusSnapshot>, SyncError>;
}

impl SnapshotSource for FermenterClient {
    fn fetch_snapshots(&self) -> Result<Vec<BatchStatusSnapshot>, SyncError> {
        Ok(self.get_dashboard()?)
    }
}
