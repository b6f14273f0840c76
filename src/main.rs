use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use patchgate::config::{discover, load_from_path, EngineConfig};
use patchgate::engine::{ApplyOptions, GitSavepoint, PatchEngine, Savepoint};
use patchgate::policy::PolicyDecision;
use patchgate::{repair_hunk_headers, sanitize, validate_patch_quality};
use similar::{ChangeTag, TextDiff};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "patchgate")]
#[command(about = "Sanitize, policy-check and apply generated unified diffs", long_about = None)]
#[command(version)]
struct Cli {
    /// Log filter (e.g. `info`, `patchgate=debug`)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a patch to a workspace
    Apply {
        /// Patch file, or `-` for stdin
        patch: String,

        /// Workspace root
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// Allow writing new files directly when every diff mode fails
        #[arg(long)]
        full_file: bool,

        /// Restrict the patch to these paths (directories end with `/`)
        #[arg(long = "scope")]
        scope: Vec<String>,

        /// Maintenance mode: lift the broad source-root protection
        #[arg(long)]
        internal: bool,

        /// Extra protected prefixes
        #[arg(long = "protect")]
        protect: Vec<String>,

        /// Extra allowed prefixes (override protection)
        #[arg(long = "allow")]
        allow: Vec<String>,

        /// Take a whole-workspace savepoint before applying
        #[arg(long, value_enum)]
        savepoint: Option<SavepointKind>,

        /// Config file (defaults to <workspace>/patchgate.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the repaired form of a patch
    Sanitize {
        /// Patch file, or `-` for stdin
        patch: String,

        /// Also relocate hunks against files in this workspace
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Show what changed instead of the result
        #[arg(short, long)]
        diff: bool,
    },

    /// Show the policy verdict for paths
    CheckPaths {
        #[arg(required = true)]
        paths: Vec<String>,

        /// Restrict to these paths (directories end with `/`)
        #[arg(long = "scope")]
        scope: Vec<String>,

        /// Maintenance mode
        #[arg(long)]
        internal: bool,

        /// Workspace whose patchgate.toml supplies the policy
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// Config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run the pre-apply quality gate on a patch
    Quality {
        /// Patch file, or `-` for stdin
        patch: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SavepointKind {
    Git,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    match cli.command {
        Commands::Apply {
            patch,
            workspace,
            full_file,
            scope,
            internal,
            protect,
            allow,
            savepoint,
            config,
        } => {
            let options = ApplyFlags {
                full_file,
                scope,
                internal,
                protect,
                allow,
                savepoint,
            };
            cmd_apply(&patch, &workspace, config.as_deref(), options)
        }

        Commands::Sanitize {
            patch,
            workspace,
            diff,
        } => cmd_sanitize(&patch, workspace.as_deref(), diff),

        Commands::CheckPaths {
            paths,
            scope,
            internal,
            workspace,
            config,
        } => cmd_check_paths(&paths, &scope, internal, &workspace, config.as_deref()),

        Commands::Quality { patch } => cmd_quality(&patch),
    }
}

struct ApplyFlags {
    full_file: bool,
    scope: Vec<String>,
    internal: bool,
    protect: Vec<String>,
    allow: Vec<String>,
    savepoint: Option<SavepointKind>,
}

fn read_patch(source: &str) -> Result<String> {
    if source == "-" {
        return io::read_to_string(io::stdin()).context("failed to read patch from stdin");
    }
    fs::read_to_string(source).with_context(|| format!("failed to read patch {source}"))
}

fn load_config(workspace: &Path, explicit: Option<&Path>) -> Result<EngineConfig> {
    let config = match explicit {
        Some(path) => load_from_path(path)?,
        None => discover(workspace)?,
    };
    Ok(config)
}

fn cmd_apply(
    patch_source: &str,
    workspace: &Path,
    config_path: Option<&Path>,
    flags: ApplyFlags,
) -> Result<()> {
    let text = read_patch(patch_source)?;
    let config = load_config(workspace, config_path)?;
    let engine = PatchEngine::from_config(&config);

    let mut git_savepoint = flags
        .savepoint
        .map(|SavepointKind::Git| GitSavepoint::new(config.apply.git.clone()));

    let options = ApplyOptions {
        full_file_mode: flags.full_file,
        scope: (!flags.scope.is_empty()).then_some(flags.scope),
        internal_mode: flags.internal,
        extra_protected: flags.protect,
        extra_allowed: flags.allow,
        savepoint: git_savepoint.as_mut().map(|sp| sp as &mut dyn Savepoint),
    };

    let outcome = engine.apply(&text, workspace, options);
    if outcome.success {
        match outcome.mode {
            Some(mode) => println!("{} Patch applied ({})", "✓".green(), mode),
            None => println!("{} Nothing to apply", "✓".green()),
        }
        return Ok(());
    }

    if let Some(error) = &outcome.error {
        if let Some(payload) = error.escalation() {
            println!("{}", payload.to_json()?);
        }
        eprintln!("{} [{}] {}", "✗".red(), error.code().yellow(), error);
    }
    std::process::exit(1);
}

fn cmd_sanitize(patch_source: &str, workspace: Option<&Path>, show_diff: bool) -> Result<()> {
    let original = read_patch(patch_source)?;
    let mut repaired = sanitize(&original);
    if let Some(workspace) = workspace {
        repaired = repair_hunk_headers(&repaired, Some(workspace));
    }

    if show_diff {
        if original == repaired {
            println!("{} Patch is already clean", "✓".green());
        } else {
            display_diff(patch_source, &original, &repaired);
        }
    } else {
        print!("{repaired}");
    }
    Ok(())
}

fn display_diff(label: &str, original: &str, modified: &str) {
    println!("{}", format!("--- {label} (original)").dimmed());
    println!("{}", format!("+++ {label} (sanitized)").dimmed());

    let diff = TextDiff::from_lines(original, modified);
    for change in diff.iter_all_changes() {
        let line = match change.tag() {
            ChangeTag::Delete => format!("-{change}").red(),
            ChangeTag::Insert => format!("+{change}").green(),
            ChangeTag::Equal => format!(" {change}").normal(),
        };
        print!("{line}");
    }
}

fn cmd_check_paths(
    paths: &[String],
    scope: &[String],
    internal: bool,
    workspace: &Path,
    config_path: Option<&Path>,
) -> Result<()> {
    let config = load_config(workspace, config_path)?;
    let policy = PatchEngine::from_config(&config).policy_for(&ApplyOptions {
        internal_mode: internal,
        ..Default::default()
    });
    let scope = (!scope.is_empty()).then_some(scope);

    let mut rejected = 0;
    for path in paths {
        let decision = policy.decide(path, scope);
        let verdict = match decision {
            PolicyDecision::Allowed => "allowed".green(),
            PolicyDecision::InScope => "ok".green(),
            PolicyDecision::Protected => "protected".red(),
            PolicyDecision::OutOfScope => "out of scope".yellow(),
            PolicyDecision::OutsideWorkspace => "outside workspace".red(),
        };
        if !decision.is_permitted() {
            rejected += 1;
        }
        println!("{path}: {verdict}");
    }

    if rejected > 0 {
        eprintln!("{} {} path(s) rejected", "✗".red(), rejected);
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_quality(patch_source: &str) -> Result<()> {
    let text = read_patch(patch_source)?;
    let issues = validate_patch_quality(&text);
    if issues.is_empty() {
        println!("{} No quality issues", "✓".green());
        return Ok(());
    }
    for issue in &issues {
        println!("{} {}", "✗".red(), issue);
    }
    std::process::exit(1);
}
