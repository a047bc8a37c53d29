//! Per-invocation build context.  The core threads this struct explicitly;
//! the process environment is only consulted here and exported again at the
//! process boundary in exec.

use anyhow::{bail, Context};
use std::path::PathBuf;

/// Absolute project root, set once per top-level invocation.
pub const ROOT_ENV: &str = "PROJECT_ROOT";
/// Decimal per-run freshness token.
pub const EPOCH_ENV: &str = "RUN_EPOCH";
/// The target whose build script spawned the current process.
pub const PARENT_ENV: &str = "PARENT_TARGET";

#[derive(Debug)]
pub struct BuildContext {
    /// Absolute, canonical project root.
    pub root: PathBuf,
    /// Freshness token for this run; record headers carrying it are proven
    /// already validated or built this run.
    pub epoch: u32,
    /// The target currently being built, when running under a script.
    pub parent: Option<PathBuf>,
}

impl BuildContext {
    /// Context for a top-level `redo` invocation: inherit the environment
    /// when nested under a running script, otherwise start a fresh run
    /// rooted at the cwd with a new epoch token.
    pub fn bootstrap() -> anyhow::Result<BuildContext> {
        let root = match std::env::var_os(ROOT_ENV) {
            Some(root) => PathBuf::from(root),
            None => std::env::current_dir().context("cannot determine working directory")?,
        };
        let root = root
            .canonicalize()
            .with_context(|| format!("cannot resolve project root {}", root.display()))?;
        let epoch = match std::env::var(EPOCH_ENV) {
            Ok(text) => text
                .parse()
                .with_context(|| format!("bad {} value {:?}", EPOCH_ENV, text))?,
            Err(_) => rand::random(),
        };
        Ok(BuildContext {
            root,
            epoch,
            parent: parent_from_env(),
        })
    }

    /// Context for the nested commands, which only make sense under a
    /// running .do script.
    pub fn from_script_env(command: &str) -> anyhow::Result<BuildContext> {
        let parent = match parent_from_env() {
            Some(parent) => parent,
            None => bail!(
                "{} must be invoked from within a .do script (no parent target in the environment)",
                command
            ),
        };
        let root = match std::env::var_os(ROOT_ENV) {
            Some(root) => PathBuf::from(root)
                .canonicalize()
                .with_context(|| format!("{}: cannot resolve {}", command, ROOT_ENV))?,
            None => bail!("{}: {} is not set", command, ROOT_ENV),
        };
        let epoch = match std::env::var(EPOCH_ENV) {
            Ok(text) => text
                .parse()
                .with_context(|| format!("{}: bad {} value {:?}", command, EPOCH_ENV, text))?,
            Err(_) => bail!("{}: {} is not set", command, EPOCH_ENV),
        };
        Ok(BuildContext {
            root,
            epoch,
            parent: Some(parent),
        })
    }
}

fn parent_from_env() -> Option<PathBuf> {
    std::env::var_os(PARENT_ENV).map(PathBuf::from)
}
