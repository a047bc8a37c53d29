use anyhow::{anyhow, bail};
use argh::FromArgs;
use redo::build::{self, Builder};
use redo::context::BuildContext;
use redo::record::Relation;
use redo::trace;
use std::path::Path;

/// a minimal redo-style build system
#[derive(FromArgs)]
struct Args {
    /// chdir before running
    #[argh(option, short = 'C', long = "chdir")]
    chdir: Option<String>,

    /// debugging tools; use "list" to list them
    #[argh(option, short = 'd', long = "debug")]
    debug: Option<String>,

    /// targets to build
    #[argh(positional)]
    targets: Vec<String>,
}

/// All four commands share this binary; which one we are is decided by the
/// name we were invoked under.
fn invoked_as() -> String {
    std::env::args()
        .next()
        .and_then(|argv0| {
            Path::new(&argv0)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "redo".to_owned())
}

fn run() -> anyhow::Result<i32> {
    let command = invoked_as();
    let args: Args = argh::from_env();

    if let Some(debug) = &args.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  trace  generate json performance trace");
                return Ok(1);
            }
            "trace" => trace::open("trace.json")?,
            _ => bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }

    if let Some(dir) = &args.chdir {
        let dir = Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    match command.as_str() {
        "redo-ifchange" => nested(&command, Relation::Changed, &args.targets),
        "redo-ifcreate" => nested(&command, Relation::CreatedGuard, &args.targets),
        "redo-always" => nested(&command, Relation::AlwaysRebuild, &args.targets),
        _ => top_level(&args.targets),
    }
}

/// `redo [targets]`: rebuild each target unconditionally, defaulting to the
/// `all` target.  Usable both at the top level, where it starts a fresh
/// run, and nested under a script, where it inherits the run and registers
/// its targets with the parent.
fn top_level(targets: &[String]) -> anyhow::Result<i32> {
    let ctx = BuildContext::bootstrap()?;
    let mut builder = Builder::new(&ctx);
    let default = [String::from("all")];
    let targets = if targets.is_empty() {
        &default[..]
    } else {
        targets
    };
    for target in targets {
        trace::scope("update", || {
            builder.update(target, Relation::AlwaysRebuild)
        })?;
        build::register_with_parent(&ctx, target, Relation::AlwaysRebuild)?;
    }
    Ok(0)
}

/// The nested commands: decide per target under the command's relation
/// kind, then append the target to the parent's record under that same
/// kind.
fn nested(command: &str, relation: Relation, targets: &[String]) -> anyhow::Result<i32> {
    let ctx = BuildContext::from_script_env(command)?;
    let mut builder = Builder::new(&ctx);
    for target in targets {
        trace::scope("update", || builder.update(target, relation))?;
        build::register_with_parent(&ctx, target, relation)?;
    }
    Ok(0)
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("redo: error: {:#}", err);
            1
        }
    };
    if let Err(err) = trace::close() {
        eprintln!("redo: error: write trace: {}", err);
    }
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
