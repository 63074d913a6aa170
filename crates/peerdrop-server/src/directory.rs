use peerdrop_shared::PeerRecord;

/// Read-only view of peers found by an external discovery mechanism.
pub trait PeerDirectory: Send + Sync {
    fn active_peers(&self) -> Vec<PeerRecord>;
}

/// Directory with no discovery source attached.
#[derive(Debug, Default)]
pub struct EmptyDirectory;

impl PeerDirectory for EmptyDirectory {
    fn active_peers(&self) -> Vec<PeerRecord> {
        Vec::new()
    }
}
