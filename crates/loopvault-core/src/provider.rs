//! Provider contract used by the lifecycle controller.
//!
//! The concrete implementation lives in `loopvault-luks`; controller logic
//! stays generic so tests can substitute a scripted provider.

use std::error::Error;
use std::fmt;
use std::path::Path;

/// Loop device currently bound to the container file.
///
/// Only ever produced by a probe: the controller treats it as ground truth
/// re-derived from the OS, never as something to cache indefinitely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice(String);

impl LoopDevice {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LoopDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of one unlock attempt. A rejected secret is data, not an error;
/// the retry loop decides what to do with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockAttempt {
    Accepted,
    Rejected { status: i32 },
}

/// Abstraction over the external tools that manage the volume.
///
/// Every method is synchronous and blocking; `probe`, `mapping_active`, and
/// `mounted` are side-effect-free and safe to call any number of times.
pub trait VolumeProvider {
    type Error: Error + Send + Sync + 'static;

    /// Report the loop device currently bound to `container_file`, if any.
    fn probe(&self, container_file: &str) -> Result<Option<LoopDevice>, Self::Error>;

    /// Bind the first free loop device to `container_file`. The device path
    /// is learned by a subsequent `probe`, not returned here.
    fn attach(&self, container_file: &str) -> Result<(), Self::Error>;

    /// Detach `device`.
    fn detach(&self, device: &LoopDevice) -> Result<(), Self::Error>;

    /// Open the encrypted mapping `name` on `device` using `secret`.
    fn unlock(
        &self,
        device: &LoopDevice,
        name: &str,
        secret: &[u8],
    ) -> Result<UnlockAttempt, Self::Error>;

    /// Close the mapping `name`.
    fn lock(&self, name: &str) -> Result<(), Self::Error>;

    /// Mount the device node at `mapper_path` on `mount_point`.
    fn mount(&self, mapper_path: &Path, mount_point: &str) -> Result<(), Self::Error>;

    /// Unmount `mount_point`.
    fn unmount(&self, mount_point: &str) -> Result<(), Self::Error>;

    /// Whether the mapping node for `name` exists under the mapper root.
    fn mapping_active(&self, name: &str) -> Result<bool, Self::Error>;

    /// Whether a filesystem is currently mounted at `mount_point`.
    fn mounted(&self, mount_point: &str) -> Result<bool, Self::Error>;
}
