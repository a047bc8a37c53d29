//! The staleness engine: decides whether targets need rebuilding and drives
//! their scripts, strictly depth-first.

use crate::context::BuildContext;
use crate::exec;
use crate::hashes;
use crate::paths::{self, RootRel};
use crate::record::{self, CodecError, Relation};
use crate::script::{self, Chosen};
use anyhow::{bail, Context};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};

/// Walks targets and their recorded prerequisites, rebuilding what is out
/// of date.  One instance per driver invocation.
pub struct Builder<'a> {
    ctx: &'a BuildContext,
    /// In-run memo of Changed-kind decisions, keyed by normalized target.
    /// Layered over the epoch short-circuit; never invalidated within a run.
    decided: FxHashMap<PathBuf, bool>,
}

impl<'a> Builder<'a> {
    pub fn new(ctx: &'a BuildContext) -> Self {
        Builder {
            ctx,
            decided: FxHashMap::default(),
        }
    }

    /// Validate `target` under the given relation, rebuilding as needed.
    /// Returns true if the target was rebuilt or otherwise counts as
    /// changed this run.
    pub fn update(&mut self, target: &str, relation: Relation) -> anyhow::Result<bool> {
        let abs = paths::normalize(Path::new(target))?;
        match relation {
            Relation::AlwaysRebuild => self.build(&abs),
            Relation::CreatedGuard => {
                // The guard fires on existence: the file having appeared at
                // all is the change signal.
                if abs.exists() {
                    self.build(&abs)
                } else {
                    Ok(false)
                }
            }
            Relation::Changed => {
                if let Some(&changed) = self.decided.get(&abs) {
                    return Ok(changed);
                }
                let changed = self.validate(&abs)?;
                self.decided.insert(abs, changed);
                Ok(changed)
            }
        }
    }

    /// The recursive decision procedure for a Changed-kind request.
    fn validate(&mut self, abs: &Path) -> anyhow::Result<bool> {
        let loc = paths::record_location(abs, &self.ctx.root)?;

        if !abs.exists() {
            match record::read(&loc) {
                Ok(rec) if rec.is_source => {
                    // A deleted source is only fatal while nothing governs
                    // it; a script created since its recording turns it back
                    // into a buildable target.
                    if script::resolve(abs).path().is_none() {
                        bail!("source file {} has been deleted", abs.display());
                    }
                }
                Ok(_) | Err(CodecError::Missing) | Err(CodecError::Malformed(_)) => {}
                Err(CodecError::Io(err)) => {
                    return Err(err)
                        .with_context(|| format!("read record for {}", abs.display()))
                }
            }
            return self.build(abs);
        }

        let rec = match record::read(&loc) {
            Ok(rec) => rec,
            Err(CodecError::Missing) | Err(CodecError::Malformed(_)) => return self.build(abs),
            Err(CodecError::Io(err)) => {
                return Err(err).with_context(|| format!("read record for {}", abs.display()))
            }
        };

        if rec.epoch == self.ctx.epoch {
            // Already validated or built this run.
            return Ok(false);
        }

        if hashes::hash_file(abs)? != rec.digest {
            return self.build(abs);
        }

        // Walk every prerequisite in recorded order, even after one has
        // reported changed: the rest still get to refresh their own records
        // for reuse later in this run.
        let mut stale = false;
        for prereq in &rec.prereqs {
            let path = self.resolve_prereq(&prereq.path);
            let changed = self.update(&path, prereq.relation)?;
            stale = stale || changed;
        }
        if stale {
            return self.build(abs);
        }

        // Proven fresh: stamp this run's epoch so reaching the target again
        // short-circuits, in this process or a nested one.
        record::write_header(&loc, self.ctx.epoch, &rec.digest, rec.is_source)?;
        Ok(false)
    }

    /// Unconditionally (re)build: run the governing script, or record the
    /// target as a source when nothing governs it.
    fn build(&mut self, abs: &Path) -> anyhow::Result<bool> {
        let loc = paths::record_location(abs, &self.ctx.root)?;
        let choice = script::resolve(abs);
        let script_path = match choice.path() {
            Some(path) => path.to_path_buf(),
            None => {
                if abs.exists() {
                    // An externally supplied input: record its digest so
                    // later edits are detectable.
                    let digest = hashes::hash_file(abs)?;
                    record::reset(&loc)?;
                    record::write_header(&loc, self.ctx.epoch, &digest, true)?;
                    self.decided.insert(abs.to_path_buf(), true);
                    return Ok(true);
                }
                bail!(
                    "{} couldn't be built because no suitable .do script exists",
                    abs.display()
                );
            }
        };

        println!("redo  {}", self.display_name(abs));

        // The impending run re-declares the prerequisites it actually
        // touches; stale entries from the previous record must not survive.
        record::reset(&loc)?;

        // The script itself is an input.  Make sure it carries a fresh
        // record of its own, then list it so edits trigger a rebuild.
        let script_name = script_path.to_string_lossy().into_owned();
        self.update(&script_name, Relation::Changed)?;
        record::append_prereq(
            &loc,
            Relation::Changed,
            &paths::stored_name(&script_path, &self.ctx.root)?,
        )?;
        if choice.chosen == Some(Chosen::General) {
            // A target-specific script created later takes precedence, so
            // its appearance must invalidate this build.
            record::append_prereq(
                &loc,
                Relation::CreatedGuard,
                &paths::stored_name(&choice.specific, &self.ctx.root)?,
            )?;
        }

        let outcome = exec::execute(self.ctx, abs, &script_path)?;
        if outcome.promoted {
            let digest = hashes::hash_file(abs)?;
            record::write_header(&loc, self.ctx.epoch, &digest, false)?;
        }
        self.decided.insert(abs.to_path_buf(), true);
        Ok(true)
    }

    /// Recorded prerequisite paths are root-relative unless they escaped
    /// the root, in which case they were stored absolute.
    fn resolve_prereq(&self, stored: &str) -> String {
        if stored.starts_with('/') {
            stored.to_owned()
        } else {
            self.ctx.root.join(stored).to_string_lossy().into_owned()
        }
    }

    fn display_name(&self, abs: &Path) -> String {
        match paths::relative_to_root(abs, &self.ctx.root) {
            RootRel::Within(rel) => rel.display().to_string(),
            _ => abs.display().to_string(),
        }
    }
}

/// Append `target` to the parent target's record under `relation`.  Called
/// by the driver commands after deciding, so the record being built up for
/// the parent reflects exactly what its script consulted.  No-op without a
/// parent (top-level invocation).
pub fn register_with_parent(
    ctx: &BuildContext,
    target: &str,
    relation: Relation,
) -> anyhow::Result<()> {
    let parent = match &ctx.parent {
        Some(parent) => parent,
        None => return Ok(()),
    };
    let parent_loc = paths::record_location(parent, &ctx.root)?;
    let abs = paths::normalize(Path::new(target))?;
    let stored = paths::stored_name(&abs, &ctx.root)?;
    record::append_prereq(&parent_loc, relation, &stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestProject {
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    impl TestProject {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().canonicalize().unwrap();
            TestProject { _dir: dir, root }
        }

        fn ctx(&self, epoch: u32) -> BuildContext {
            BuildContext {
                root: self.root.clone(),
                epoch,
                parent: None,
            }
        }

        fn write(&self, name: &str, content: &str) {
            std::fs::write(self.root.join(name), content).unwrap();
        }

        fn read(&self, name: &str) -> String {
            String::from_utf8(std::fs::read(self.root.join(name)).unwrap()).unwrap()
        }

        fn target(&self, name: &str) -> String {
            self.root.join(name).to_string_lossy().into_owned()
        }

        fn record(&self, name: &str) -> record::DependencyRecord {
            let loc = paths::record_location(&self.root.join(name), &self.root).unwrap();
            record::read(&loc).unwrap()
        }
    }

    #[test]
    fn records_source_and_validates_it() {
        let p = TestProject::new();
        p.write("gen.c", "int main() {}\n");

        let ctx = p.ctx(1);
        let mut b = Builder::new(&ctx);
        assert!(b.update(&p.target("gen.c"), Relation::Changed).unwrap());
        let rec = p.record("gen.c");
        assert!(rec.is_source);
        assert_eq!(rec.epoch, 1);

        // Same run, different process: the epoch short-circuits.
        let mut b = Builder::new(&ctx);
        assert!(!b.update(&p.target("gen.c"), Relation::Changed).unwrap());

        // New run, unchanged bytes: digest comparison says fresh.
        let ctx = p.ctx(2);
        let mut b = Builder::new(&ctx);
        assert!(!b.update(&p.target("gen.c"), Relation::Changed).unwrap());
        assert_eq!(p.record("gen.c").epoch, 2);
    }

    #[test]
    fn missing_source_without_script_is_fatal() {
        let p = TestProject::new();
        let ctx = p.ctx(1);
        let mut b = Builder::new(&ctx);
        let err = b.update(&p.target("ghost.c"), Relation::Changed).unwrap_err();
        assert!(err.to_string().contains("no suitable .do script"));
    }

    #[test]
    fn deleted_source_is_fatal() {
        let p = TestProject::new();
        p.write("gen.c", "x");
        let ctx = p.ctx(1);
        let mut b = Builder::new(&ctx);
        b.update(&p.target("gen.c"), Relation::Changed).unwrap();

        std::fs::remove_file(p.root.join("gen.c")).unwrap();
        let ctx = p.ctx(2);
        let mut b = Builder::new(&ctx);
        let err = b.update(&p.target("gen.c"), Relation::Changed).unwrap_err();
        assert!(err.to_string().contains("has been deleted"));
    }

    #[test]
    fn deleted_source_with_new_script_rebuilds() {
        let p = TestProject::new();
        p.write("gen.c", "handwritten\n");
        let ctx = p.ctx(1);
        let mut b = Builder::new(&ctx);
        b.update(&p.target("gen.c"), Relation::Changed).unwrap();
        assert!(p.record("gen.c").is_source);

        // The file stops being a source once a script exists to produce it.
        std::fs::remove_file(p.root.join("gen.c")).unwrap();
        p.write("gen.c.do", "echo generated > \"$3\"\n");
        let ctx = p.ctx(2);
        let mut b = Builder::new(&ctx);
        assert!(b.update(&p.target("gen.c"), Relation::Changed).unwrap());
        assert_eq!(p.read("gen.c"), "generated\n");
        assert!(!p.record("gen.c").is_source);
    }

    #[test]
    fn unreadable_record_of_missing_target_is_fatal() {
        let p = TestProject::new();
        let loc = paths::record_location(&p.root.join("out.txt"), &p.root).unwrap();
        // A directory where the record file should be makes the read fail
        // with something other than NotFound.
        std::fs::create_dir(&loc).unwrap();

        let ctx = p.ctx(1);
        let mut b = Builder::new(&ctx);
        let err = b.update(&p.target("out.txt"), Relation::Changed).unwrap_err();
        assert!(err.to_string().contains("read record"));
    }

    #[test]
    fn builds_and_is_idempotent_across_runs() {
        let p = TestProject::new();
        p.write("out.txt.do", "echo hello > \"$3\"\n");

        let ctx = p.ctx(1);
        let mut b = Builder::new(&ctx);
        assert!(b.update(&p.target("out.txt"), Relation::Changed).unwrap());
        assert_eq!(p.read("out.txt"), "hello\n");

        let rec = p.record("out.txt");
        assert_eq!(rec.epoch, 1);
        assert!(!rec.is_source);
        assert_eq!(rec.prereqs.len(), 1);
        assert_eq!(rec.prereqs[0].relation, Relation::Changed);
        assert_eq!(rec.prereqs[0].path, "out.txt.do");
        // The script got its own source record.
        assert!(p.record("out.txt.do").is_source);

        // New run: nothing changed, nothing rebuilt.
        let ctx = p.ctx(2);
        let mut b = Builder::new(&ctx);
        assert!(!b.update(&p.target("out.txt"), Relation::Changed).unwrap());
        assert_eq!(p.record("out.txt").epoch, 2);
    }

    #[test]
    fn digest_mismatch_forces_rebuild() {
        let p = TestProject::new();
        p.write("out.txt.do", "echo hello > \"$3\"\n");

        let ctx = p.ctx(1);
        Builder::new(&ctx)
            .update(&p.target("out.txt"), Relation::Changed)
            .unwrap();

        // Tamper with the bytes behind the record's back.
        p.write("out.txt", "corrupted");
        let ctx = p.ctx(2);
        let mut b = Builder::new(&ctx);
        assert!(b.update(&p.target("out.txt"), Relation::Changed).unwrap());
        assert_eq!(p.read("out.txt"), "hello\n");
    }

    #[test]
    fn changed_prerequisite_propagates() {
        let p = TestProject::new();
        p.write("gen.c", "one\n");
        p.write("out.txt.do", "echo hello > \"$3\"\n");

        let ctx = p.ctx(1);
        let mut b = Builder::new(&ctx);
        b.update(&p.target("out.txt"), Relation::Changed).unwrap();
        b.update(&p.target("gen.c"), Relation::Changed).unwrap();
        // Splice gen.c into out.txt's record the way a nested
        // redo-ifchange invocation would have.
        let loc = paths::record_location(&p.root.join("out.txt"), &p.root).unwrap();
        record::append_prereq(&loc, Relation::Changed, "gen.c").unwrap();

        // Unchanged prerequisite: no rebuild.
        let ctx = p.ctx(2);
        let mut b = Builder::new(&ctx);
        assert!(!b.update(&p.target("out.txt"), Relation::Changed).unwrap());

        // Edit the prerequisite: out.txt itself still hashes clean, but the
        // recursion must flag it stale and rebuild it.
        p.write("gen.c", "two\n");
        let ctx = p.ctx(3);
        let mut b = Builder::new(&ctx);
        assert!(b.update(&p.target("out.txt"), Relation::Changed).unwrap());
        // The rebuild reset the record; the undeclared prerequisite is gone.
        let paths: Vec<_> = p
            .record("out.txt")
            .prereqs
            .iter()
            .map(|pr| pr.path.clone())
            .collect();
        assert_eq!(paths, vec!["out.txt.do".to_owned()]);
    }

    #[test]
    fn created_guard_fires_only_on_existence() {
        let p = TestProject::new();
        let ctx = p.ctx(1);
        let mut b = Builder::new(&ctx);
        assert!(!b.update(&p.target("foo.txt.do"), Relation::CreatedGuard).unwrap());

        p.write("foo.txt.do", "echo x > \"$3\"\n");
        let mut b = Builder::new(&ctx);
        assert!(b.update(&p.target("foo.txt.do"), Relation::CreatedGuard).unwrap());
    }

    #[test]
    fn general_script_records_specific_guard() {
        let p = TestProject::new();
        p.write("default.txt.do", "echo general > \"$3\"\n");

        let ctx = p.ctx(1);
        let mut b = Builder::new(&ctx);
        b.update(&p.target("foo.txt"), Relation::Changed).unwrap();
        assert_eq!(p.read("foo.txt"), "general\n");

        let entries: Vec<_> = p
            .record("foo.txt")
            .prereqs
            .iter()
            .map(|pr| (pr.relation, pr.path.clone()))
            .collect();
        assert_eq!(
            entries,
            vec![
                (Relation::Changed, "default.txt.do".to_owned()),
                (Relation::CreatedGuard, "foo.txt.do".to_owned()),
            ]
        );

        // The specific script appearing invalidates the cached decision.
        p.write("foo.txt.do", "echo specific > \"$3\"\n");
        let ctx = p.ctx(2);
        let mut b = Builder::new(&ctx);
        assert!(b.update(&p.target("foo.txt"), Relation::Changed).unwrap());
        assert_eq!(p.read("foo.txt"), "specific\n");
    }

    #[test]
    fn always_rebuild_reruns_the_script() {
        let p = TestProject::new();
        p.write("count.do", "echo run >> runs.log\necho out > \"$3\"\n");

        let ctx = p.ctx(1);
        let mut b = Builder::new(&ctx);
        b.update(&p.target("count"), Relation::AlwaysRebuild).unwrap();
        b.update(&p.target("count"), Relation::AlwaysRebuild).unwrap();
        assert_eq!(p.read("runs.log"), "run\nrun\n");
    }

    #[test]
    fn script_edit_triggers_rebuild() {
        let p = TestProject::new();
        p.write("out.txt.do", "echo one > \"$3\"\n");

        let ctx = p.ctx(1);
        Builder::new(&ctx)
            .update(&p.target("out.txt"), Relation::Changed)
            .unwrap();
        assert_eq!(p.read("out.txt"), "one\n");

        p.write("out.txt.do", "echo two > \"$3\"\n");
        let ctx = p.ctx(2);
        let mut b = Builder::new(&ctx);
        assert!(b.update(&p.target("out.txt"), Relation::Changed).unwrap());
        assert_eq!(p.read("out.txt"), "two\n");
    }

    #[test]
    fn registers_with_parent_record() {
        let p = TestProject::new();
        let parent = p.root.join("out.txt");
        let ctx = BuildContext {
            root: p.root.clone(),
            epoch: 1,
            parent: Some(parent.clone()),
        };
        p.write("gen.c", "x");

        register_with_parent(&ctx, &p.target("gen.c"), Relation::Changed).unwrap();
        let loc = paths::record_location(&parent, &p.root).unwrap();
        let bytes = std::fs::read(loc).unwrap();
        assert!(bytes.ends_with(b"c:gen.c\n"));
    }
}
