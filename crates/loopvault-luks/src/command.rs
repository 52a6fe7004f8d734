//! Execution wrapper for the external volume tools.
//!
//! Keeps shell integration isolated so lifecycle logic stays testable
//! (fake binaries, deterministic stdout parsing). Every invocation blocks
//! until the tool exits; there is no timeout, so a wedged tool stalls the
//! caller — a documented limitation of this single-operator design.

use loopvault_core::error::{VaultError, VaultResult};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) status: i32,
}

#[derive(Debug, Clone)]
pub(crate) struct ToolCommand {
    binary: PathBuf,
}

impl ToolCommand {
    pub(crate) fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Short program name used in diagnostics.
    pub(crate) fn program(&self) -> String {
        self.binary
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.binary.to_string_lossy().into_owned())
    }

    /// Run the tool and capture its output. The exit status comes back as
    /// data; only failure to spawn is an error.
    pub(crate) fn run(&self, args: &[&str]) -> VaultResult<Output> {
        self.run_with_input(args, None)
    }

    /// Run the tool, streaming `input` to its stdin (then closing it)
    /// before waiting for termination.
    pub(crate) fn run_with_input(&self, args: &[&str], input: Option<&[u8]>) -> VaultResult<Output> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        if input.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn()?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(payload)?;
                stdin.flush().ok();
            }
        }

        let output = child.wait_with_output()?;
        Ok(Output {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status: output.status.code().unwrap_or(-1),
        })
    }

    /// Run an invocation the caller requires to succeed, converting a
    /// non-zero exit into a command failure.
    pub(crate) fn run_checked(&self, args: &[&str]) -> VaultResult<()> {
        let out = self.run(args)?;
        if out.status == 0 {
            return Ok(());
        }
        Err(command_failure(&self.program(), &out))
    }
}

pub(crate) fn command_failure(program: &str, output: &Output) -> VaultError {
    VaultError::Command {
        program: program.to_string(),
        status: output.status,
        detail: output_diagnostic(output),
    }
}

/// Prefer stderr for diagnostics, fall back to stdout.
pub(crate) fn output_diagnostic(output: &Output) -> String {
    let stderr = output.stderr.trim();
    let stdout = output.stdout.trim();
    if !stderr.is_empty() {
        stderr.to_string()
    } else if !stdout.is_empty() {
        stdout.to_string()
    } else {
        "no additional output".to_string()
    }
}

/// Older cryptsetup releases only understand the `luksOpen`/`luksClose`
/// verbs and report the modern ones as unknown actions.
pub(crate) fn action_unsupported(output: &Output) -> bool {
    let diagnostic = output_diagnostic(output).to_ascii_lowercase();
    diagnostic.contains("unknown action")
        || diagnostic.contains("unknown command")
        || diagnostic.contains("invalid action")
        || diagnostic.contains("invalid command")
        || diagnostic.contains("unknown option")
}
