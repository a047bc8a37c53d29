//! Target path normalization and the on-disk layout of the record store.

use anyhow::{bail, Context};
use std::path::{Path, PathBuf};

/// Per-project directory holding one dependency record per target.
pub const DEPS_DIR: &str = ".redo/deps";

/// Resolve `path` to an absolute, symlink-independent form.  The final
/// component need not exist; its ancestor directories must.
pub fn normalize(path: &Path) -> anyhow::Result<PathBuf> {
    let name = match path.file_name() {
        Some(name) => name,
        None => bail!("invalid target path {:?}", path),
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let dir = dir
        .canonicalize()
        .with_context(|| format!("cannot resolve parent directory of {:?}", path))?;
    Ok(dir.join(name))
}

/// Where a normalized path sits relative to the project root.
#[derive(Debug, PartialEq, Eq)]
pub enum RootRel {
    /// The path is the root itself.
    Root,
    /// In-tree; the root prefix has been stripped.
    Within(PathBuf),
    /// The path escapes the project root; kept absolute.
    Escaped(PathBuf),
}

pub fn relative_to_root(path: &Path, root: &Path) -> RootRel {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => RootRel::Root,
        Ok(rel) => RootRel::Within(rel.to_path_buf()),
        Err(_) => RootRel::Escaped(path.to_path_buf()),
    }
}

/// The form of a target path as stored in record files: root-relative for
/// in-tree targets, absolute for root-escaping ones.
pub fn stored_name(path: &Path, root: &Path) -> anyhow::Result<String> {
    match relative_to_root(path, root) {
        RootRel::Root => bail!("target {} is the project root", path.display()),
        RootRel::Within(rel) => Ok(rel.to_string_lossy().into_owned()),
        RootRel::Escaped(abs) => Ok(abs.to_string_lossy().into_owned()),
    }
}

/// Map a normalized target to its record file, creating intermediate
/// directories on demand.  In-tree and root-escaping targets land in two
/// disjoint subtrees, each mirroring the target's path structure.
pub fn record_location(target: &Path, root: &Path) -> anyhow::Result<PathBuf> {
    let store = root.join(DEPS_DIR);
    let loc = match relative_to_root(target, root) {
        RootRel::Root => bail!("target {} is the project root", target.display()),
        RootRel::Within(rel) => store.join("local").join(rel),
        RootRel::Escaped(abs) => {
            let trimmed = abs.strip_prefix("/").unwrap_or(&abs).to_path_buf();
            store.join("abs").join(trimmed)
        }
    };
    if let Some(parent) = loc.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create record directory {}", parent.display()))?;
    }
    Ok(loc)
}

/// Final path component, or the path itself when it has none.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// The extension of a path's basename, from (and including) its last dot.
/// Empty if the basename has no dot.
pub fn take_extension(path: &str) -> &str {
    let base = basename(path);
    match base.rfind('.') {
        Some(i) => &base[i..],
        None => "",
    }
}

/// `name` with everything from its last dot stripped.
pub fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(i) => &name[..i],
        None => name,
    }
}
