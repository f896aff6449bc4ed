use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use redgreen::server::{LOOPBACK_ANY, SERVER_ENV};
use redgreen::{
    Config, FailureLedger, HookRegistry, ReporterClient, ResultServer, ResultSink, RunLoop, SessionDir, ShellRunner,
};

#[derive(Parser)]
#[command(name = "redgreen")]
#[command(about = "Continuous test runner: watch the tree, run what changed, hammer failures until green")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    watch: WatchArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the project and run tests on changes (default)
    Watch(WatchArgs),

    /// Print the known test files and the class map, then exit
    Debug(WatchArgs),

    /// Talk to a running result server, as a test process would
    Report(ReportArgs),
}

#[derive(Args, Clone, Default)]
struct WatchArgs {
    /// Directories to watch (default: from config, or the current directory)
    directories: Vec<String>,

    /// Print the known test files and the class map, then exit
    #[arg(short, long)]
    debug: bool,

    /// Log changed files and mapping decisions
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Do not echo the test command
    #[arg(short, long)]
    quiet: bool,

    /// Config file to load instead of ~/.autotest.toml and ./.autotest.toml (repeatable)
    #[arg(long = "rc", value_name = "PATH")]
    rc: Vec<PathBuf>,
}

#[derive(Args)]
struct ReportArgs {
    /// Session id (pid) of the daemon to report to, found through its address file
    #[arg(long, conflicts_with = "addr")]
    server: Option<u32>,

    /// Explicit server address (default: $AUTOTEST_SERVER)
    #[arg(long)]
    addr: Option<SocketAddr>,

    #[command(subcommand)]
    action: ReportAction,
}

#[derive(Subcommand)]
enum ReportAction {
    /// Begin a test session
    Start,
    /// Record one failing test method
    Failure {
        file: String,
        class_name: String,
        method_name: String,
    },
    /// Finish the test session
    Done,
    /// Print the daemon's current failure ledger as JSON
    Status,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:?}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Watch(args)) => cmd_watch(args).await,
        Some(Commands::Debug(args)) => cmd_watch(WatchArgs { debug: true, ..args }).await,
        Some(Commands::Report(args)) => {
            setup_logging(false, true);
            cmd_report(args).await
        }
        None => cmd_watch(cli.watch).await,
    }
}

fn setup_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("redgreen={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(args: &WatchArgs) -> Result<Config> {
    let rc_paths = if args.rc.is_empty() {
        Config::default_rc_paths()
    } else {
        args.rc.clone()
    };

    let mut config = Config::load(&rc_paths)?;

    if !args.directories.is_empty() {
        config.watch.directories = args.directories.clone();
    }
    config.run.debug |= args.debug;
    config.run.verbose |= args.verbose;
    config.run.quiet |= args.quiet;

    Ok(config)
}

async fn cmd_watch(args: WatchArgs) -> Result<()> {
    setup_logging(args.verbose, args.quiet);

    let root = std::env::current_dir()
        .and_then(std::fs::canonicalize)
        .context("Could not determine the project directory")?;
    let config = load_config(&args)?;

    let session = std::process::id();
    let sink = Arc::new(ResultSink::new(Arc::new(FailureLedger::new()), &root));
    let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();

    if config.run.debug {
        let mut run_loop = RunLoop::new(&config, &root, sink, ShellRunner::new(&root), interrupt_rx)?;
        print_debug(&mut run_loop);
        return Ok(());
    }

    let hooks = HookRegistry::from_config(&config.hooks)?;
    let session_dir = SessionDir::create(session)?;
    let mut server = ResultServer::new(LOOPBACK_ANY, sink.clone()).with_address_file(session_dir.address_file());
    let addr = server.start().await?;

    let runner = ShellRunner::new(&root).with_env(SERVER_ENV, addr.to_string());
    let mut run_loop = match RunLoop::new(&config, &root, sink, runner, interrupt_rx) {
        Ok(run_loop) => run_loop
            .with_session(session)
            .with_reporter_lib(&session_dir.lib_dir())
            .with_hooks(hooks)
            .with_server(server),
        Err(e) => {
            server.stop().await;
            return Err(e);
        }
    };

    tokio::spawn(forward_interrupts(interrupt_tx));

    print_banner(&root, &config, addr);
    let result = run_loop.run().await;
    drop(run_loop);
    drop(session_dir);
    result
}

/// Every Ctrl+C becomes one message on the run loop's interrupt channel
async fn forward_interrupts(tx: mpsc::UnboundedSender<()>) {
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot listen for interrupts: {}", e);
            return;
        }
        if tx.send(()).is_err() {
            return;
        }
    }
}

fn print_banner(root: &Path, config: &Config, addr: SocketAddr) {
    if config.run.quiet {
        return;
    }

    println!(
        "\n{} {} {}",
        "👀".cyan(),
        "Watching".bold(),
        config.watch.directories.join(", ").cyan()
    );
    println!("   {} {}", "root:".dimmed(), root.display());
    println!("   {} {}", "results:".dimmed(), addr);
    println!("{}", "Press Ctrl+C to reset, twice to quit\n".dimmed());
}

fn print_debug<R: redgreen::CommandRunner>(run_loop: &mut RunLoop<'_, R>) {
    let report = run_loop.debug_report();

    println!("{}", "Known test files:".bold());
    if report.test_files.is_empty() {
        println!("  {}", "none".dimmed());
    }
    for file in &report.test_files {
        println!("  {} {}", "•".green(), file);
    }

    println!("\n{}", "Class map:".bold());
    for (class_name, file) in &report.class_map {
        println!("  {} {} {}", class_name.cyan(), "→".dimmed(), file);
    }
}

async fn cmd_report(args: ReportArgs) -> Result<()> {
    let client = match (args.server, args.addr) {
        (Some(session), _) => ReporterClient::for_session(session)?,
        (None, Some(addr)) => ReporterClient::new(addr),
        (None, None) => ReporterClient::from_env()?,
    };

    match args.action {
        ReportAction::Start => client.start().await,
        ReportAction::Failure {
            file,
            class_name,
            method_name,
        } => client.failure(&file, &class_name, &method_name).await,
        ReportAction::Done => client.done().await,
        ReportAction::Status => {
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}
