//! Lifecycle orchestration for the managed volume.
//!
//! The controller owns the configuration snapshot and a probed view of the
//! loop binding, and drives the attach → unlock → mount sequence and its
//! exact reverse. Cancellation during unlock is a modelled outcome rather
//! than an unwind, so the rollback step stays a visible branch in the state
//! machine.

#[cfg(test)]
mod tests;

use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::passphrase::PassphraseSource;
use crate::provider::{LoopDevice, UnlockAttempt, VolumeProvider};
use log::{info, warn};
use std::fmt;

/// Where the volume currently sits in the attach/unlock/mount sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No loop device bound to the container file.
    Unmounted,
    /// Loop device bound, mapping not yet open.
    Attached,
    /// Mapping open, filesystem not yet mounted.
    Unlocked,
    /// Fully active.
    Mounted,
}

impl LifecycleState {
    /// Coarse view rendered by status surfaces: bound or not.
    pub fn is_active(self) -> bool {
        !matches!(self, LifecycleState::Unmounted)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Unmounted => "unmounted",
            LifecycleState::Attached => "attached",
            LifecycleState::Unlocked => "unlocked",
            LifecycleState::Mounted => "mounted",
        })
    }
}

/// How an `engage` call concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngageOutcome {
    /// The volume is attached, unlocked, and mounted.
    Engaged,
    /// The operator declined to supply a passphrase; the loop device bound
    /// during the attempt has been detached again.
    Cancelled,
}

/// How the unlock retry loop concluded. The only exits are acceptance and
/// operator cancellation; the loop itself never gives up.
enum UnlockOutcome {
    Unlocked,
    Cancelled,
}

/// State machine driving one volume through its lifecycle.
///
/// `binding` and `state` are re-derived from the OS after every transition;
/// they are a snapshot, not a source of truth. One controller per process,
/// one caller thread — exclusivity over the loop device, the mapping, and
/// the mount point is an environmental precondition, not something enforced
/// here.
pub struct VolumeController<P> {
    config: VaultConfig,
    provider: P,
    binding: Option<LoopDevice>,
    state: LifecycleState,
}

impl<P> VolumeController<P>
where
    P: VolumeProvider<Error = VaultError>,
{
    /// Build a controller, deriving the initial state from a probe rather
    /// than assuming the volume starts unmounted.
    pub fn new(config: VaultConfig, provider: P) -> VaultResult<Self> {
        let mut controller = Self {
            config,
            provider,
            binding: None,
            state: LifecycleState::Unmounted,
        };
        controller.refresh()?;
        Ok(controller)
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Loop device bound to the container file, as of the last refresh.
    pub fn binding(&self) -> Option<&LoopDevice> {
        self.binding.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Re-probe the loop binding and re-derive the lifecycle state.
    /// Side-effect-free; safe to call any number of times.
    pub fn refresh(&mut self) -> VaultResult<()> {
        let volume = &self.config.volume;
        self.binding = self.provider.probe(&volume.loopback_file)?;
        self.state = match &self.binding {
            None => LifecycleState::Unmounted,
            Some(_) => {
                if !self.provider.mapping_active(&volume.luks_device_name)? {
                    LifecycleState::Attached
                } else if self.provider.mounted(&volume.mount_point)? {
                    LifecycleState::Mounted
                } else {
                    LifecycleState::Unlocked
                }
            }
        };
        Ok(())
    }

    /// Attach the container file, unlock its mapping, and mount the
    /// filesystem.
    ///
    /// Any must-succeed step that fails aborts the operation in place, with
    /// `binding`/`state` left as they were at the point of failure. The one
    /// compensated path is operator cancellation during unlock: the loop
    /// device bound in step one is detached again and the call returns
    /// [`EngageOutcome::Cancelled`].
    pub fn engage(&mut self, source: &mut dyn PassphraseSource) -> VaultResult<EngageOutcome> {
        if let Some(device) = &self.binding {
            return Err(VaultError::Lifecycle(format!(
                "volume already attached to {device}; disengage it first"
            )));
        }

        let volume = self.config.volume.clone();
        self.provider.attach(&volume.loopback_file)?;

        // losetup -f prints nothing in first-free-device mode; the device
        // path only comes from a fresh probe.
        let Some(device) = self.provider.probe(&volume.loopback_file)? else {
            return Err(VaultError::Probe(format!(
                "attach reported success but no loop device is bound to {}",
                volume.loopback_file
            )));
        };
        self.binding = Some(device.clone());
        self.state = LifecycleState::Attached;
        info!("attached {} to {device}", volume.loopback_file);

        match self.unlock_with_retry(source, &device, &volume.luks_device_name)? {
            UnlockOutcome::Unlocked => {}
            UnlockOutcome::Cancelled => {
                warn!("passphrase entry cancelled; detaching {device}");
                self.provider.detach(&device)?;
                self.refresh()?;
                return Ok(EngageOutcome::Cancelled);
            }
        }
        self.state = LifecycleState::Unlocked;
        info!("unlocked mapping {}", volume.luks_device_name);

        self.provider
            .mount(&volume.mapper_path(), &volume.mount_point)?;
        self.state = LifecycleState::Mounted;
        info!(
            "mounted {} at {}",
            volume.mapper_path().display(),
            volume.mount_point
        );

        self.refresh()?;
        Ok(EngageOutcome::Engaged)
    }

    /// Unmount the filesystem, close the mapping, and detach the loop
    /// device, in exactly that order.
    ///
    /// A failing step aborts immediately and leaves `binding` unrefreshed;
    /// the resulting mixed state is surfaced to the operator instead of
    /// being reconciled here.
    pub fn disengage(&mut self) -> VaultResult<()> {
        let Some(device) = self.binding.clone() else {
            return Err(VaultError::Lifecycle(
                "volume has no loop binding; nothing to disengage".into(),
            ));
        };

        let volume = &self.config.volume;
        self.provider.unmount(&volume.mount_point)?;
        self.provider.lock(&volume.luks_device_name)?;
        self.provider.detach(&device)?;
        info!("released {} from {device}", volume.loopback_file);

        self.refresh()?;
        Ok(())
    }

    /// Ask for a passphrase and try it against the device until the unlock
    /// tool accepts one or the operator gives up. Unbounded on purpose: the
    /// only exits are acceptance and cancellation. A rejected attempt has
    /// no effect on loop or mount state.
    fn unlock_with_retry(
        &self,
        source: &mut dyn PassphraseSource,
        device: &LoopDevice,
        name: &str,
    ) -> VaultResult<UnlockOutcome> {
        loop {
            let Some(secret) = source.request() else {
                return Ok(UnlockOutcome::Cancelled);
            };
            match self.provider.unlock(device, name, &secret)? {
                UnlockAttempt::Accepted => return Ok(UnlockOutcome::Unlocked),
                UnlockAttempt::Rejected { status } => {
                    warn!("unlock attempt for mapping {name} rejected (status {status})");
                }
            }
        }
    }
}
