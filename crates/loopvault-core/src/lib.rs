#![forbid(unsafe_code)]

//! Core building blocks shared by loopvault binaries.
//!
//! Configuration, contracts, and the lifecycle controller live here so the
//! system-integration crate and the CLI can focus on host plumbing and
//! operator surfaces.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod passphrase;
pub mod provider;

pub use config::{ToolsCfg, VaultConfig, VolumeCfg};
pub use error::{VaultError, VaultResult};
pub use lifecycle::{EngageOutcome, LifecycleState, VolumeController};
pub use passphrase::{Passphrase, PassphraseSource};
pub use provider::{LoopDevice, UnlockAttempt, VolumeProvider};
