pub mod block;
pub mod device;
pub mod policy;
mod stats;
pub mod walk;


pub use block::{CachingDeviceBlock, TAG_INVALID};
pub use device::{
    Access, CachingDevice, DeviceArena, DeviceId, DeviceParams, Lookup, TagStrategy, WayPartition,
};
pub use policy::ReplacementPolicy;
pub use stats::Stats;
pub use walk::{PageWalkClassifier, PageWalkHistogram, PageWalkOutcome, WalkPatternCount};
