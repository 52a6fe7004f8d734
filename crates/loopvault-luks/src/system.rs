//! System-backed `VolumeProvider` implementation.
//!
//! Wraps `losetup`, `cryptsetup`, `mount`, and `umount`. Binary locations
//! come from the `[tools]` config section, well-known install paths, or
//! `PATH`, in that order.

use crate::command::{action_unsupported, command_failure, output_diagnostic, ToolCommand};
use log::debug;
use loopvault_core::config::{VaultConfig, MAPPER_ROOT};
use loopvault_core::error::{VaultError, VaultResult};
use loopvault_core::provider::{LoopDevice, UnlockAttempt, VolumeProvider};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const DEFAULT_LOSETUP_PATHS: &[&str] = &[
    "/usr/sbin/losetup",
    "/usr/bin/losetup",
    "/sbin/losetup",
    "/bin/losetup",
    "/usr/local/sbin/losetup",
];
const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];
const DEFAULT_MOUNT_PATHS: &[&str] = &["/usr/bin/mount", "/bin/mount", "/usr/sbin/mount"];
const DEFAULT_UMOUNT_PATHS: &[&str] = &["/usr/bin/umount", "/bin/umount", "/usr/sbin/umount"];

const DEFAULT_MOUNTS_TABLE: &str = "/proc/mounts";
pub(crate) const MOUNTS_OVERRIDE_ENV: &str = "LOOPVAULT_MOUNTS_PATH";

/// Provider that manages the volume via the host tools.
#[derive(Debug, Clone)]
pub struct SystemVolumeProvider {
    losetup: ToolCommand,
    cryptsetup: ToolCommand,
    mount: ToolCommand,
    umount: ToolCommand,
}

impl SystemVolumeProvider {
    /// Build a provider from configuration, resolving all four tool
    /// binaries up front so a misconfigured path fails at start-up.
    pub fn from_config(config: &VaultConfig) -> VaultResult<Self> {
        let tools = &config.tools;
        let losetup = resolve_binary(tools.losetup_path.as_deref(), DEFAULT_LOSETUP_PATHS, "losetup")?;
        let cryptsetup = resolve_binary(
            tools.cryptsetup_path.as_deref(),
            DEFAULT_CRYPTSETUP_PATHS,
            "cryptsetup",
        )?;
        let mount = resolve_binary(tools.mount_path.as_deref(), DEFAULT_MOUNT_PATHS, "mount")?;
        let umount = resolve_binary(tools.umount_path.as_deref(), DEFAULT_UMOUNT_PATHS, "umount")?;
        debug!(
            "using binaries losetup={} cryptsetup={} mount={} umount={}",
            losetup.display(),
            cryptsetup.display(),
            mount.display(),
            umount.display()
        );

        Ok(Self {
            losetup: ToolCommand::new(losetup),
            cryptsetup: ToolCommand::new(cryptsetup),
            mount: ToolCommand::new(mount),
            umount: ToolCommand::new(umount),
        })
    }
}

impl VolumeProvider for SystemVolumeProvider {
    type Error = VaultError;

    fn probe(&self, container_file: &str) -> VaultResult<Option<LoopDevice>> {
        let out = self
            .losetup
            .run(&["-j", container_file])
            .map_err(|err| VaultError::Probe(format!("failed to run losetup: {err}")))?;
        if out.status != 0 {
            return Err(VaultError::Probe(format!(
                "losetup -j {container_file} exited with status {}: {}",
                out.status,
                output_diagnostic(&out)
            )));
        }
        parse_probe_output(&out.stdout)
    }

    fn attach(&self, container_file: &str) -> VaultResult<()> {
        self.losetup.run_checked(&["-f", container_file])
    }

    fn detach(&self, device: &LoopDevice) -> VaultResult<()> {
        self.losetup.run_checked(&["-d", device.as_str()])
    }

    fn unlock(
        &self,
        device: &LoopDevice,
        name: &str,
        secret: &[u8],
    ) -> VaultResult<UnlockAttempt> {
        // cryptsetup reads the passphrase up to the first newline on stdin.
        let mut payload = Zeroizing::new(Vec::with_capacity(secret.len() + 1));
        payload.extend_from_slice(secret);
        payload.push(b'\n');

        let args = ["open", device.as_str(), name];
        let mut out = self
            .cryptsetup
            .run_with_input(&args, Some(payload.as_slice()))?;
        if out.status != 0 && action_unsupported(&out) {
            let fallback = ["luksOpen", device.as_str(), name];
            out = self
                .cryptsetup
                .run_with_input(&fallback, Some(payload.as_slice()))?;
        }

        if out.status == 0 {
            Ok(UnlockAttempt::Accepted)
        } else {
            Ok(UnlockAttempt::Rejected { status: out.status })
        }
    }

    fn lock(&self, name: &str) -> VaultResult<()> {
        let mut out = self.cryptsetup.run(&["close", name])?;
        if out.status != 0 && action_unsupported(&out) {
            out = self.cryptsetup.run(&["luksClose", name])?;
        }
        if out.status == 0 {
            return Ok(());
        }
        Err(command_failure(&self.cryptsetup.program(), &out))
    }

    fn mount(&self, mapper_path: &Path, mount_point: &str) -> VaultResult<()> {
        let mapper = mapper_path.to_string_lossy();
        self.mount.run_checked(&[mapper.as_ref(), mount_point])
    }

    fn unmount(&self, mount_point: &str) -> VaultResult<()> {
        self.umount.run_checked(&[mount_point])
    }

    fn mapping_active(&self, name: &str) -> VaultResult<bool> {
        Ok(Path::new(MAPPER_ROOT).join(name).exists())
    }

    fn mounted(&self, mount_point: &str) -> VaultResult<bool> {
        let table = fs::read_to_string(mounts_table_path())?;
        Ok(parse_mount_table(&table, mount_point))
    }
}

fn resolve_binary(
    configured: Option<&str>,
    candidates: &[&str],
    name: &str,
) -> VaultResult<PathBuf> {
    if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(VaultError::InvalidConfig(format!(
                "{name} binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    for candidate in candidates {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    find_in_path(name).ok_or_else(|| {
        VaultError::InvalidConfig(format!(
            "unable to locate {name} binary; tried {candidates:?} and PATH"
        ))
    })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}

fn mounts_table_path() -> PathBuf {
    env::var(MOUNTS_OVERRIDE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_MOUNTS_TABLE))
}

/// Parse `losetup -j` output: the text before the first colon of the first
/// line is the device path; empty output means no binding.
fn parse_probe_output(stdout: &str) -> VaultResult<Option<LoopDevice>> {
    let Some(line) = stdout.lines().find(|line| !line.trim().is_empty()) else {
        return Ok(None);
    };

    match line.split_once(':') {
        Some((device, _)) if !device.trim().is_empty() => {
            Ok(Some(LoopDevice::new(device.trim())))
        }
        _ => Err(VaultError::Probe(format!(
            "unparseable losetup output: {line:?}"
        ))),
    }
}

/// Scan a mount table snapshot for an entry mounted at `mount_point`.
fn parse_mount_table(table: &str, mount_point: &str) -> bool {
    table.lines().any(|line| {
        let mut parts = line.split_whitespace();
        let _device = parts.next();
        matches!(parts.next(), Some(target) if unescape_mount_field(target) == mount_point)
    })
}

/// `/proc/mounts` escapes spaces and other separators as three-digit
/// octal sequences.
fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut oct = String::new();
            for _ in 0..3 {
                match chars.peek() {
                    Some(next) if next.is_ascii_digit() => oct.push(chars.next().unwrap()),
                    _ => break,
                }
            }
            if oct.len() == 3 {
                if let Ok(value) = u8::from_str_radix(&oct, 8) {
                    output.push(value as char);
                    continue;
                }
            }
            output.push('\\');
            output.push_str(&oct);
        } else {
            output.push(ch);
        }
    }

    output
}
