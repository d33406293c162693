//! Invocation of platform trust-store utilities.

use std::process::Command;

use tracing::debug;

use super::TrustError;

/// Runs an external program to completion.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, failing on a non-zero exit status.
    fn run(&self, program: &str, args: &[&str]) -> Result<(), TrustError>;
}

/// Runs commands on the host, with the terminal attached so `sudo` can prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<(), TrustError> {
        let resolved = which::which(program).map_err(|_| TrustError::CommandNotFound {
            program: program.to_string(),
        })?;

        debug!("running {} {}", resolved.display(), args.join(" "));

        let status = Command::new(&resolved)
            .args(args)
            .status()
            .map_err(|source| TrustError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(TrustError::CommandFailed {
                command: command_line(program, args),
                status: status.code(),
            })
        }
    }
}

/// Renders a command for diagnostics.
pub(crate) fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
