//! Locating the build script that governs a target.

use crate::paths;
use std::path::{Path, PathBuf};

/// Which of the two candidates exists and wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chosen {
    Specific,
    General,
}

/// Result of script resolution for one target.  Both candidate paths are
/// kept: even when the general script runs, the specific candidate matters
/// as a creation guard.
#[derive(Debug)]
pub struct ScriptChoice {
    /// `{target}.do`, next to the target.
    pub specific: PathBuf,
    /// `default{ext}.do` in the target's directory.
    pub general: PathBuf,
    pub chosen: Option<Chosen>,
}

impl ScriptChoice {
    pub fn path(&self) -> Option<&Path> {
        match self.chosen {
            Some(Chosen::Specific) => Some(&self.specific),
            Some(Chosen::General) => Some(&self.general),
            None => None,
        }
    }
}

/// Find the governing script for a normalized target.  Exactly two
/// candidates, in precedence order: the target-specific script, then the
/// directory default for the target's extension.  There is deliberately no
/// further fallback.
pub fn resolve(target: &Path) -> ScriptChoice {
    let mut specific = target.as_os_str().to_owned();
    specific.push(".do");
    let specific = PathBuf::from(specific);

    let dir = match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let base = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let general = dir.join(format!("default{}.do", paths::take_extension(&base)));

    let chosen = if specific.is_file() {
        Some(Chosen::Specific)
    } else if general.is_file() {
        Some(Chosen::General)
    } else {
        None
    };

    ScriptChoice {
        specific,
        general,
        chosen,
    }
}
