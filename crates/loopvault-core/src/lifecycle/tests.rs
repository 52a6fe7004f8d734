use super::*;
use crate::config::{ToolsCfg, VaultConfig, VolumeCfg};
use crate::passphrase::{Passphrase, PassphraseSource};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

#[derive(Default)]
struct MockState {
    bound: Option<String>,
    mapping_open: bool,
    mounted: bool,
    calls: Vec<String>,
    attach_device: Option<String>,
    fail_unmount: bool,
    rejections: u32,
    unlock_attempts: u32,
    observed_secrets: Vec<Vec<u8>>,
}

/// Scripted stand-in for the external tools, recording every mutating call
/// in order. Read-only probes are deliberately not recorded so the call log
/// matches the external command sequence.
#[derive(Clone)]
struct MockProvider {
    inner: Arc<Mutex<MockState>>,
}

impl MockProvider {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                attach_device: Some("/dev/loop7".to_string()),
                ..MockState::default()
            })),
        }
    }

    /// Start out fully active on `device`, as a probe would report it.
    fn active_on(device: &str) -> Self {
        let provider = Self::new();
        {
            let mut state = provider.inner.lock().unwrap();
            state.bound = Some(device.to_string());
            state.mapping_open = true;
            state.mounted = true;
        }
        provider
    }

    fn reject_first(&self, attempts: u32) {
        self.inner.lock().unwrap().rejections = attempts;
    }

    fn fail_unmount(&self) {
        self.inner.lock().unwrap().fail_unmount = true;
    }

    /// Attach succeeds but binds nothing, so the follow-up probe sees an
    /// inconsistent environment.
    fn attach_binds_nothing(&self) {
        self.inner.lock().unwrap().attach_device = None;
    }

    fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn unlock_attempts(&self) -> u32 {
        self.inner.lock().unwrap().unlock_attempts
    }

    fn observed_secrets(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().observed_secrets.clone()
    }

    fn attach_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.starts_with("attach "))
            .count()
    }
}

impl VolumeProvider for MockProvider {
    type Error = VaultError;

    fn probe(&self, _container_file: &str) -> VaultResult<Option<LoopDevice>> {
        Ok(self.inner.lock().unwrap().bound.clone().map(LoopDevice::new))
    }

    fn attach(&self, container_file: &str) -> VaultResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(format!("attach {container_file}"));
        state.bound = state.attach_device.clone();
        Ok(())
    }

    fn detach(&self, device: &LoopDevice) -> VaultResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(format!("detach {device}"));
        state.bound = None;
        Ok(())
    }

    fn unlock(
        &self,
        device: &LoopDevice,
        name: &str,
        secret: &[u8],
    ) -> VaultResult<UnlockAttempt> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(format!("unlock {device} {name}"));
        state.unlock_attempts += 1;
        state.observed_secrets.push(secret.to_vec());
        if state.unlock_attempts <= state.rejections {
            return Ok(UnlockAttempt::Rejected { status: 2 });
        }
        state.mapping_open = true;
        Ok(UnlockAttempt::Accepted)
    }

    fn lock(&self, name: &str) -> VaultResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(format!("lock {name}"));
        state.mapping_open = false;
        Ok(())
    }

    fn mount(&self, mapper_path: &Path, mount_point: &str) -> VaultResult<()> {
        let mut state = self.inner.lock().unwrap();
        state
            .calls
            .push(format!("mount {} {mount_point}", mapper_path.display()));
        state.mounted = true;
        Ok(())
    }

    fn unmount(&self, mount_point: &str) -> VaultResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(format!("umount {mount_point}"));
        if state.fail_unmount {
            return Err(VaultError::Command {
                program: "umount".to_string(),
                status: 32,
                detail: format!("umount: {mount_point}: target is busy"),
            });
        }
        state.mounted = false;
        Ok(())
    }

    fn mapping_active(&self, _name: &str) -> VaultResult<bool> {
        Ok(self.inner.lock().unwrap().mapping_open)
    }

    fn mounted(&self, _mount_point: &str) -> VaultResult<bool> {
        Ok(self.inner.lock().unwrap().mounted)
    }
}

struct ScriptedSource {
    answers: VecDeque<Option<&'static str>>,
    requests: u32,
}

impl ScriptedSource {
    fn new(answers: &[Option<&'static str>]) -> Self {
        Self {
            answers: answers.iter().copied().collect(),
            requests: 0,
        }
    }
}

impl PassphraseSource for ScriptedSource {
    fn request(&mut self) -> Option<Passphrase> {
        self.requests += 1;
        self.answers
            .pop_front()
            .expect("passphrase script exhausted")
            .map(|text| Zeroizing::new(text.as_bytes().to_vec()))
    }
}

fn sample_config() -> VaultConfig {
    VaultConfig {
        volume: VolumeCfg {
            loopback_file: "/data/vault.img".to_string(),
            luks_device_name: "vault".to_string(),
            mount_point: "/mnt/vault".to_string(),
        },
        tools: ToolsCfg::default(),
        path: PathBuf::from("/etc/loopvault.toml"),
    }
}

#[test]
fn initial_state_is_derived_from_probe() {
    let idle = VolumeController::new(sample_config(), MockProvider::new()).unwrap();
    assert_eq!(idle.state(), LifecycleState::Unmounted);
    assert!(idle.binding().is_none());

    let active =
        VolumeController::new(sample_config(), MockProvider::active_on("/dev/loop3")).unwrap();
    assert_eq!(active.state(), LifecycleState::Mounted);
    assert_eq!(active.binding().unwrap().as_str(), "/dev/loop3");
}

#[test]
fn refresh_is_idempotent_without_intervening_mutation() {
    let mut controller =
        VolumeController::new(sample_config(), MockProvider::active_on("/dev/loop3")).unwrap();
    let first = (controller.binding().cloned(), controller.state());
    controller.refresh().unwrap();
    let second = (controller.binding().cloned(), controller.state());
    assert_eq!(first, second);
}

#[test]
fn engage_runs_attach_unlock_mount_in_order() {
    let provider = MockProvider::new();
    let mut controller = VolumeController::new(sample_config(), provider.clone()).unwrap();
    let mut source = ScriptedSource::new(&[Some("correct-secret")]);

    let outcome = controller.engage(&mut source).unwrap();
    assert_eq!(outcome, EngageOutcome::Engaged);
    assert_eq!(
        provider.calls(),
        vec![
            "attach /data/vault.img",
            "unlock /dev/loop7 vault",
            "mount /dev/mapper/vault /mnt/vault",
        ]
    );
    assert_eq!(provider.observed_secrets(), vec![b"correct-secret".to_vec()]);
    assert_eq!(controller.state(), LifecycleState::Mounted);
    assert_eq!(controller.binding().unwrap().as_str(), "/dev/loop7");
}

#[test]
fn engage_retries_until_a_passphrase_is_accepted() {
    let provider = MockProvider::new();
    provider.reject_first(3);
    let mut controller = VolumeController::new(sample_config(), provider.clone()).unwrap();
    let mut source = ScriptedSource::new(&[
        Some("wrong-1"),
        Some("wrong-2"),
        Some("wrong-3"),
        Some("correct-secret"),
    ]);

    let outcome = controller.engage(&mut source).unwrap();
    assert_eq!(outcome, EngageOutcome::Engaged);
    assert_eq!(provider.unlock_attempts(), 4);
    assert_eq!(source.requests, 4);
    // The loop device is bound once, never rebound between attempts.
    assert_eq!(provider.attach_count(), 1);
    assert_eq!(controller.state(), LifecycleState::Mounted);
}

#[test]
fn engage_rolls_back_when_operator_cancels_immediately() {
    let provider = MockProvider::new();
    let mut controller = VolumeController::new(sample_config(), provider.clone()).unwrap();
    let mut source = ScriptedSource::new(&[None]);

    let outcome = controller.engage(&mut source).unwrap();
    assert_eq!(outcome, EngageOutcome::Cancelled);
    assert_eq!(provider.unlock_attempts(), 0);
    assert_eq!(
        provider.calls(),
        vec!["attach /data/vault.img", "detach /dev/loop7"]
    );
    assert!(controller.binding().is_none());
    assert_eq!(controller.state(), LifecycleState::Unmounted);
}

#[test]
fn engage_rolls_back_when_operator_gives_up_after_rejections() {
    let provider = MockProvider::new();
    provider.reject_first(u32::MAX);
    let mut controller = VolumeController::new(sample_config(), provider.clone()).unwrap();
    let mut source = ScriptedSource::new(&[Some("wrong-1"), Some("wrong-2"), None]);

    let outcome = controller.engage(&mut source).unwrap();
    assert_eq!(outcome, EngageOutcome::Cancelled);
    assert_eq!(provider.unlock_attempts(), 2);
    assert!(controller.binding().is_none());
    assert_eq!(controller.state(), LifecycleState::Unmounted);
}

#[test]
fn engage_on_attached_volume_is_a_lifecycle_error() {
    let mut controller =
        VolumeController::new(sample_config(), MockProvider::active_on("/dev/loop3")).unwrap();
    let mut source = ScriptedSource::new(&[]);

    let err = controller.engage(&mut source).unwrap_err();
    assert!(matches!(err, VaultError::Lifecycle(_)));
    assert_eq!(source.requests, 0);
}

#[test]
fn engage_aborts_when_attach_leaves_no_binding() {
    let provider = MockProvider::new();
    provider.attach_binds_nothing();
    let mut controller = VolumeController::new(sample_config(), provider.clone()).unwrap();
    let mut source = ScriptedSource::new(&[]);

    let err = controller.engage(&mut source).unwrap_err();
    assert!(matches!(err, VaultError::Probe(_)));
    assert_eq!(provider.calls(), vec!["attach /data/vault.img"]);
}

#[test]
fn disengage_tears_down_in_reverse_order() {
    let provider = MockProvider::active_on("/dev/loop3");
    let mut controller = VolumeController::new(sample_config(), provider.clone()).unwrap();

    controller.disengage().unwrap();
    assert_eq!(
        provider.calls(),
        vec!["umount /mnt/vault", "lock vault", "detach /dev/loop3"]
    );
    assert!(controller.binding().is_none());
    assert_eq!(controller.state(), LifecycleState::Unmounted);
}

#[test]
fn disengage_aborts_after_failed_unmount() {
    let provider = MockProvider::active_on("/dev/loop3");
    provider.fail_unmount();
    let mut controller = VolumeController::new(sample_config(), provider.clone()).unwrap();

    let err = controller.disengage().unwrap_err();
    assert!(matches!(err, VaultError::Command { status: 32, .. }));
    // Close and detach are never reached; the stale binding is kept as the
    // last known view rather than silently reconciled.
    assert_eq!(provider.calls(), vec!["umount /mnt/vault"]);
    assert_eq!(controller.binding().unwrap().as_str(), "/dev/loop3");
    assert!(controller.state().is_active());
}

#[test]
fn disengage_without_binding_is_a_lifecycle_error() {
    let mut controller = VolumeController::new(sample_config(), MockProvider::new()).unwrap();
    let err = controller.disengage().unwrap_err();
    assert!(matches!(err, VaultError::Lifecycle(_)));
}

#[test]
fn round_trip_returns_to_unmounted() {
    let provider = MockProvider::new();
    let mut controller = VolumeController::new(sample_config(), provider.clone()).unwrap();
    let mut source = ScriptedSource::new(&[Some("correct-secret")]);

    assert_eq!(
        controller.engage(&mut source).unwrap(),
        EngageOutcome::Engaged
    );
    controller.disengage().unwrap();

    assert!(controller.binding().is_none());
    assert_eq!(controller.state(), LifecycleState::Unmounted);
    assert!(provider.probe("/data/vault.img").unwrap().is_none());
}

#[test]
fn coarse_view_collapses_all_bound_states() {
    assert!(!LifecycleState::Unmounted.is_active());
    assert!(LifecycleState::Attached.is_active());
    assert!(LifecycleState::Unlocked.is_active());
    assert!(LifecycleState::Mounted.is_active());
}
