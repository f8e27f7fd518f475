//! patchup command line interface.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use patchup::fix::{self, FixOptions};
use patchup::pipeline::{self, PipelineOptions};
use patchup::runner::{self, Profile, Scope};

#[derive(Parser)]
#[command(
    name = "patchup",
    version,
    about = "Run, diagnose, and repair generated software projects"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the verification profile once and record artifacts
    Run(RunArgs),
    /// Run, then repeatedly apply deterministic fixes until checks pass
    Fix(FixArgs),
    /// Generate (optionally), verify, fix, and report a single outcome
    Pipeline(PipelineArgs),
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// Project directory to operate on
    #[arg(long)]
    path: Option<PathBuf>,

    /// Verification profile: python-pytest, node-vite, generic-shell, legacy
    #[arg(long, default_value = "python-pytest")]
    profile: String,

    /// Shell command for the generic-shell profile (repeatable, runs in order)
    #[arg(long = "cmd")]
    commands: Vec<String>,

    /// Per-step timeout in seconds
    #[arg(long, default_value_t = 900)]
    timeout: u64,

    /// Scope for the legacy profile: backend, frontend, all
    #[arg(long, default_value = "all")]
    scope: String,

    /// Skip npm install steps
    #[arg(long)]
    no_install: bool,

    /// Also write a JSON run summary
    #[arg(long)]
    json_summary: bool,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct FixArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Maximum number of apply-and-recheck cycles
    #[arg(long, default_value_t = 3)]
    max_iterations: usize,

    /// Write patches to the project (off by default)
    #[arg(long, conflicts_with = "dry_run")]
    apply: bool,

    /// Plan and report only, guarantee no project changes
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct PipelineArgs {
    #[command(flatten)]
    fix: FixArgs,

    /// Idea text for project generation; requires --generator-cmd
    #[arg(long)]
    idea: Option<String>,

    /// External command that scaffolds a project and prints its path
    #[arg(long = "generator-cmd")]
    generate_command: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PATCHUP_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_profile(raw: &str) -> Result<Profile, i32> {
    Profile::parse(raw).ok_or_else(|| {
        eprintln!("[ERROR] unknown profile '{}'", raw);
        2
    })
}

fn parse_scope(raw: &str) -> Result<Scope, i32> {
    Scope::parse(raw).ok_or_else(|| {
        eprintln!("[ERROR] unknown scope '{}'", raw);
        2
    })
}

fn resolve_project(common: &CommonArgs) -> Result<PathBuf, i32> {
    let path = common.path.clone().unwrap_or_else(|| PathBuf::from("."));
    if !path.is_dir() {
        eprintln!("[ERROR] path not found: {}", path.display());
        return Err(2);
    }
    Ok(path)
}

fn command_label(subcommand: &str, common: &CommonArgs) -> String {
    let mut label = format!("patchup {} --profile {}", subcommand, common.profile);
    if let Some(path) = &common.path {
        label.push_str(&format!(" --path {}", path.display()));
    }
    for cmd in &common.commands {
        label.push_str(&format!(" --cmd '{}'", cmd));
    }
    label
}

fn fix_options(args: &FixArgs, subcommand: &str) -> Result<FixOptions, i32> {
    Ok(FixOptions {
        max_iterations: args.max_iterations,
        apply_changes: args.apply,
        dry_run: args.dry_run,
        timeout: Duration::from_secs(args.common.timeout),
        scope: parse_scope(&args.common.scope)?,
        profile: parse_profile(&args.common.profile)?,
        commands: args.common.commands.clone(),
        no_install: args.common.no_install,
        json_summary: args.common.json_summary,
        command_label: command_label(subcommand, &args.common),
    })
}

fn cmd_run(args: &RunArgs) -> Result<i32, i32> {
    let profile = parse_profile(&args.common.profile)?;
    let root = resolve_project(&args.common)?;
    let opts = runner::RunOptions {
        timeout: Duration::from_secs(args.common.timeout),
        no_install: args.common.no_install,
        json_summary: args.common.json_summary,
        commands: args.common.commands.clone(),
        scope: parse_scope(&args.common.scope)?,
        command_label: command_label("run", &args.common),
    };
    match runner::execute(profile, &root, &opts) {
        Ok(report) => {
            println!("[RUN] {} ({})", report.status.as_str(), report.summary_path);
            Ok(report.exit_code())
        }
        Err(e) => {
            eprintln!("[ERROR] {:#}", e);
            Err(1)
        }
    }
}

fn cmd_fix(args: &FixArgs) -> Result<i32, i32> {
    let root = resolve_project(&args.common)?;
    let opts = fix_options(args, "fix")?;
    fix::fix_loop(&root, &opts)
        .map(|outcome| outcome.exit_code())
        .map_err(|e| {
            eprintln!("[ERROR] {:#}", e);
            1
        })
}

fn cmd_pipeline(args: &PipelineArgs) -> Result<i32, i32> {
    let fix_opts = fix_options(&args.fix, "pipeline")?;
    let generating = args.idea.is_some();
    let project = if generating {
        // Generation resolves the project later; the path flag is ignored.
        None
    } else {
        Some(resolve_project(&args.fix.common)?)
    };
    let workdir = std::env::current_dir().map_err(|e| {
        eprintln!("[ERROR] cannot determine working directory: {}", e);
        1
    })?;
    let opts = PipelineOptions {
        idea: args.idea.clone(),
        generate_command: args.generate_command.clone(),
        workdir,
        fix: fix_opts,
    };
    match pipeline::run_pipeline(project, &opts) {
        Ok(outcome) => Ok(outcome.status.exit_code()),
        Err(e) => {
            eprintln!("[ERROR] {:#}", e);
            Err(1)
        }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let code = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Fix(args) => cmd_fix(args),
        Commands::Pipeline(args) => cmd_pipeline(args),
    };
    std::process::exit(match code {
        Ok(code) => code,
        Err(code) => code,
    });
}
