//! Recipe command execution
//!
//! Recipe commands are opaque shell strings with two interpolation points:
//! `@DESTDIR@` (the staging directory) and `@MAKEJOBS@` (effective build
//! parallelism). They run through `sh -c` in the package work directory,
//! optionally under `fakeroot` so ownership metadata lands in the staged
//! tree without real privileges, and optionally inside a chroot. Output is
//! appended to the per-package build log.

use crate::BuildError;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Everything one command needs to run.
pub struct CommandContext<'a> {
    /// Working directory (the build tree)
    pub cwd: &'a Path,
    /// Staging directory substituted for `@DESTDIR@`
    pub destdir: &'a Path,
    /// Parallelism substituted for `@MAKEJOBS@`
    pub makejobs: usize,
    /// Extra environment from the recipe
    pub env: &'a BTreeMap<String, String>,
    /// Per-package build log (appended)
    pub log_file: &'a Path,
    /// Run under `fakeroot` when available
    pub fakeroot: bool,
    /// Run inside this root via `chroot`
    pub chroot: Option<&'a Path>,
    /// Attempts per command
    pub retry: u32,
}

/// Substitute the two interpolation tokens.
pub fn interpolate(command: &str, destdir: &Path, makejobs: usize) -> String {
    command
        .replace("@DESTDIR@", &destdir.to_string_lossy())
        .replace("@MAKEJOBS@", &makejobs.to_string())
}

/// Run a command sequence in order; each command gets the retry budget.
pub fn run_commands(commands: &[String], ctx: &CommandContext) -> Result<(), BuildError> {
    for command in commands {
        run_one(command, ctx)?;
    }
    Ok(())
}

fn run_one(command: &str, ctx: &CommandContext) -> Result<(), BuildError> {
    let rendered = interpolate(command, ctx.destdir, ctx.makejobs);
    let attempts = ctx.retry.max(1);
    let mut last_status = -1;

    for attempt in 0..attempts {
        if attempt > 0 {
            warn!("Retry {}/{} for: {}", attempt + 1, attempts, rendered);
        }

        let mut process = build_process(&rendered, ctx);
        let output = process.output()?;
        append_log(ctx.log_file, &rendered, &output)?;

        if output.status.success() {
            debug!("Command ok: {}", rendered);
            return Ok(());
        }
        last_status = output.status.code().unwrap_or(-1);
        warn!("Command exited {}: {}", last_status, rendered);
    }

    Err(BuildError::CommandFailed {
        command: rendered,
        status: last_status,
    })
}

fn build_process(rendered: &str, ctx: &CommandContext) -> Command {
    let mut process = match (ctx.chroot, ctx.fakeroot && fakeroot_available()) {
        (Some(root), _) => {
            // chroot implies root privileges; fakeroot is redundant there
            let mut c = Command::new("chroot");
            c.arg(root).arg("/bin/sh").arg("-c").arg(rendered);
            c
        }
        (None, true) => {
            let mut c = Command::new("fakeroot");
            c.arg("sh").arg("-c").arg(rendered);
            c
        }
        (None, false) => {
            let mut c = Command::new("sh");
            c.arg("-c").arg(rendered);
            c
        }
    };

    if ctx.chroot.is_none() {
        process.current_dir(ctx.cwd);
    }
    process
        .envs(ctx.env)
        .env("DESTDIR", ctx.destdir)
        .env("MAKEFLAGS", format!("-j{}", ctx.makejobs))
        .stdin(Stdio::null());
    process
}

fn fakeroot_available() -> bool {
    which::which("fakeroot").is_ok()
}

fn append_log(
    log_file: &Path,
    command: &str,
    output: &std::process::Output,
) -> Result<(), BuildError> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut log = OpenOptions::new().create(true).append(true).open(log_file)?;
    writeln!(log, "$ {command}")?;
    log.write_all(&output.stdout)?;
    log.write_all(&output.stderr)?;
    writeln!(log, "[exit {}]", output.status.code().unwrap_or(-1))?;
    Ok(())
}
