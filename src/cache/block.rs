/// Marks an empty way. Tags are line or page numbers of block sizes >= 4 bytes,
/// so no real tag (domain bit included) can reach this value.
pub const TAG_INVALID: u64 = u64::MAX;

/// One way of a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachingDeviceBlock {
    pub tag: u64,
    pub counter: u32,
    /// Only translation devices record an owner; plain caches keep `None`.
    pub owner_pid: Option<u32>,
}

impl Default for CachingDeviceBlock {
    fn default() -> Self {
        Self {
            tag: TAG_INVALID,
            counter: 0,
            owner_pid: None,
        }
    }
}

impl CachingDeviceBlock {
    pub fn is_valid(&self) -> bool {
        self.tag != TAG_INVALID
    }

    pub fn matches(&self, tag: u64, owner_pid: Option<u32>) -> bool {
        self.is_valid() && self.tag == tag && self.owner_pid == owner_pid
    }
}
