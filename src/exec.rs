//! Runs a target's governing script and promotes or discards its staged
//! output.

use crate::context::{self, BuildContext};
use crate::paths;
use anyhow::{bail, Context};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Reserved suffix for the staging file a script writes to before its
/// output is promoted over the target.
pub const STAGING_SUFFIX: &str = ".redoing.tmp";

/// At most this many interpreter words are taken from a shebang line.
const MAX_SHEBANG_WORDS: usize = 4;

/// What one script execution did.
#[derive(Debug)]
pub struct BuildOutcome {
    /// Whether the staged output replaced the target.
    pub promoted: bool,
}

fn staging_path(target: &Path) -> PathBuf {
    let mut staged = target.as_os_str().to_owned();
    staged.push(STAGING_SUFFIX);
    PathBuf::from(staged)
}

/// Derive the interpreter command for a script from its own shebang line,
/// falling back to a fail-fast POSIX shell.
fn interpreter(script: &Path) -> anyhow::Result<Vec<String>> {
    let bytes =
        std::fs::read(script).with_context(|| format!("read script {}", script.display()))?;
    if bytes.starts_with(b"#!") {
        let line = match bytes.iter().position(|&b| b == b'\n') {
            Some(end) => &bytes[2..end],
            None => &bytes[2..],
        };
        let line = String::from_utf8_lossy(line);
        let words: Vec<String> = line
            .split_whitespace()
            .take(MAX_SHEBANG_WORDS)
            .map(str::to_owned)
            .collect();
        if !words.is_empty() {
            return Ok(words);
        }
    }
    Ok(vec!["/bin/sh".to_owned(), "-e".to_owned()])
}

/// Run `script` to build the normalized target, blocking until it exits.
///
/// The script runs in its own directory with the classic redo argument
/// interface appended: the script name, the target, the target's basename
/// with its extension stripped, and the absolute staging output path.  A
/// clean exit promotes non-empty staged output over the target; empty
/// output is discarded and the target is left untouched.  Any failure of
/// the script is fatal.
pub fn execute(ctx: &BuildContext, target: &Path, script: &Path) -> anyhow::Result<BuildOutcome> {
    let staging = staging_path(target);
    let script_dir = match script.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let script_name = script.file_name().unwrap_or_else(|| script.as_os_str());
    let target_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| target.to_string_lossy().into_owned());

    let argv = interpreter(script)?;
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .arg(script_name)
        .arg(&target_name)
        .arg(paths::strip_extension(&target_name))
        .arg(&staging)
        .current_dir(script_dir)
        .env(context::ROOT_ENV, &ctx.root)
        .env(context::EPOCH_ENV, ctx.epoch.to_string())
        .env(context::PARENT_ENV, target)
        .status()
        .with_context(|| format!("spawn script {}", script.display()))?;

    if !status.success() {
        discard(&staging)?;
        match status.signal() {
            Some(sig) => bail!("script {} terminated by signal {}", script.display(), sig),
            None => bail!(
                "script {} failed with exit status {}",
                script.display(),
                status.code().unwrap_or(-1)
            ),
        }
    }

    let size = match std::fs::metadata(&staging) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
        Err(err) => {
            return Err(err).with_context(|| format!("stat staged output {}", staging.display()))
        }
    };
    if size > 0 {
        std::fs::rename(&staging, target).with_context(|| {
            format!(
                "promote staged output {} over {}",
                staging.display(),
                target.display()
            )
        })?;
        Ok(BuildOutcome { promoted: true })
    } else {
        discard(&staging)?;
        Ok(BuildOutcome { promoted: false })
    }
}

fn discard(staging: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(staging) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("remove staged output {}", staging.display()))
        }
    }
}
