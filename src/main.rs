//! tasklift CLI - ephemeral remote compute sessions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tasklift::config::{self, Config};
use tasklift::provider::{
    ComputeProvider, ErrorClass, ExecOptions, OutputLine, Provider, ProviderContext, ProviderError,
    ProviderKind, Session, SessionOptions, SessionStatus,
};
use tasklift::{Credentials, EventSink};

#[derive(Parser)]
#[command(name = "tasklift")]
#[command(about = "Ephemeral remote compute sessions for coding agents", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "tasklift.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file
    Validate,

    /// Print what the configured provider supports
    Capabilities,

    /// Initialize a new configuration file
    Init {
        /// Provider type (ec2, ecs, codespaces, docker, local)
        #[arg(short, long, default_value = "local", value_parser = parse_kind)]
        provider: ProviderKind,
    },

    /// Check credentials and shared infrastructure
    Check,

    /// Create a session, run one command in it, then tear it down
    Run {
        /// Session ID. Default: a random one
        #[arg(long)]
        task_id: Option<String>,

        /// Repository to check out
        #[arg(long)]
        repo: Option<String>,

        #[arg(long)]
        branch: Option<String>,

        #[arg(long)]
        user: Option<String>,

        /// Command timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Leave the session running afterwards
        #[arg(long)]
        keep: bool,

        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Run a command in an existing session
    Exec {
        session: String,

        #[arg(long)]
        timeout: Option<u64>,

        /// Attach the terminal (SSH and provider exec only)
        #[arg(short, long)]
        interactive: bool,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Show a session
    Status { session: String },

    /// List sessions
    List {
        /// Only sessions of this user
        #[arg(long)]
        user: Option<String>,
    },

    /// Terminate a session
    Terminate { session: String },
}

fn parse_kind(s: &str) -> Result<ProviderKind, String> {
    match s {
        "ec2" => Ok(ProviderKind::Ec2),
        "ecs" => Ok(ProviderKind::Ecs),
        "codespaces" => Ok(ProviderKind::Codespaces),
        "docker" => Ok(ProviderKind::Docker),
        "local" => Ok(ProviderKind::Local),
        other => Err(format!(
            "unknown provider '{}'. Use: ec2, ecs, codespaces, docker, local",
            other
        )),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    let code = match dispatch(&cli).await {
        Ok(code) => code,
        Err(e) => report_error(&e),
    };
    std::process::exit(code);
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { provider } => init_config(*provider),
        Commands::Capabilities => {
            let provider = build_provider(&cli.config, cli.verbose)?;
            println!("{}", serde_json::to_string_pretty(&provider.capabilities())?);
            Ok(0)
        }
        Commands::Check => {
            let provider = build_provider(&cli.config, cli.verbose)?;
            let spinner = spinner(format!("Checking {} provider", provider.kind()));
            let result = provider.initialize().await;
            spinner.finish_and_clear();
            result?;
            println!("{} {} provider is ready", console::style("ok").green(), provider.kind());
            Ok(0)
        }
        Commands::Run {
            task_id,
            repo,
            branch,
            user,
            timeout,
            keep,
            command,
        } => {
            let provider = build_provider(&cli.config, cli.verbose)?;
            let mut opts = SessionOptions::new(
                task_id
                    .clone()
                    .unwrap_or_else(|| format!("task-{}", uuid::Uuid::new_v4().simple())),
            );
            opts.repository = repo.clone();
            opts.branch = branch.clone();
            opts.user_id = user.clone();
            run_once(&provider, &opts, &shell_words::join(command), *timeout, *keep).await
        }
        Commands::Exec {
            session,
            timeout,
            interactive,
            command,
        } => {
            let provider = build_provider(&cli.config, cli.verbose)?;
            let mut opts = exec_options(*timeout);
            if *interactive {
                opts = opts.interactive();
            }
            let result = provider
                .execute_command(session, &shell_words::join(command), &opts)
                .await;
            if let Some(error) = &result.error {
                eprintln!("{}", console::style(error).red());
            }
            Ok(exit_code_of(result.exit_code, result.timed_out))
        }
        Commands::Status { session } => {
            let provider = build_provider(&cli.config, cli.verbose)?;
            print_session(&provider.get_session_status(session).await?);
            Ok(0)
        }
        Commands::List { user } => {
            let provider = build_provider(&cli.config, cli.verbose)?;
            let sessions = provider.list_sessions(user.as_deref()).await?;
            if sessions.is_empty() {
                println!("No sessions");
            }
            for session in &sessions {
                print_session(session);
            }
            Ok(0)
        }
        Commands::Terminate { session } => {
            let provider = build_provider(&cli.config, cli.verbose)?;
            provider.terminate_session(session).await?;
            println!("Terminated {}", session);
            Ok(0)
        }
    }
}

fn load(config_path: &Path) -> Result<Config> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

fn build_provider(config_path: &Path, verbose: bool) -> Result<Provider> {
    let config = load(config_path)?;
    let events = if verbose {
        let (sink, mut rx) = EventSink::channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(json) = serde_json::to_string(&event) {
                    debug!("event {}", json);
                }
            }
        });
        sink
    } else {
        EventSink::disabled()
    };
    let ctx = ProviderContext::new(Credentials::from_env()).with_events(events);
    Ok(Provider::from_config(&config, ctx)?)
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn exec_options(timeout: Option<u64>) -> ExecOptions {
    let on_output: Arc<dyn Fn(&OutputLine) + Send + Sync> = Arc::new(|line| match line {
        OutputLine::Stdout(s) => println!("{}", s),
        OutputLine::Stderr(s) => eprintln!("{}", s),
    });
    let opts = ExecOptions::default().on_output(on_output);
    match timeout {
        Some(secs) => opts.timeout(Duration::from_secs(secs)),
        None => opts,
    }
}

fn exit_code_of(exit_code: Option<i32>, timed_out: bool) -> i32 {
    if timed_out {
        124
    } else {
        exit_code.unwrap_or(1)
    }
}

async fn run_once(
    provider: &Provider,
    opts: &SessionOptions,
    command: &str,
    timeout: Option<u64>,
    keep: bool,
) -> Result<i32> {
    let spinner = spinner(format!("Creating {} session {}", provider.kind(), opts.task_id));
    let created = provider.create_session(opts).await;
    spinner.finish_and_clear();
    let session = created?;
    eprintln!(
        "{} session {} on {}",
        console::style("created").green(),
        session.id,
        session.environment_id
    );

    let result = provider
        .execute_command(&session.id, command, &exec_options(timeout))
        .await;
    if result.timed_out {
        eprintln!("{}", console::style("command timed out").red());
    } else if let Some(error) = &result.error {
        eprintln!("{}", console::style(error).red());
    }

    if keep {
        eprintln!("Keeping session {}", session.id);
    } else {
        provider.terminate_session(&session.id).await?;
        eprintln!("{} session {}", console::style("terminated").yellow(), session.id);
    }
    Ok(exit_code_of(result.exit_code, result.timed_out))
}

fn print_session(session: &Session) {
    let status = match session.status {
        SessionStatus::Active => console::style(session.status.to_string()).green(),
        SessionStatus::Terminated => console::style(session.status.to_string()).dim(),
        SessionStatus::Error => console::style(session.status.to_string()).red(),
    };
    println!(
        "{}  {}  {}  {}",
        session.id, session.provider, status, session.environment_id
    );
    for (key, value) in &session.metadata {
        println!("    {}: {}", key, value);
    }
}

fn validate_config(config_path: &Path) -> Result<i32> {
    let config = load(config_path)?;
    let result = config.validate();
    for warning in &result.warnings {
        println!("{} {}", console::style("warning:").yellow(), warning);
    }
    if !result.valid {
        for error in &result.errors {
            eprintln!("{} {}", console::style("error:").red(), error);
        }
        return Ok(2);
    }
    println!("Configuration valid!");
    println!("  Provider: {}", config.provider.kind());
    Ok(0)
}

fn init_config(kind: ProviderKind) -> Result<i32> {
    let path = PathBuf::from("tasklift.toml");
    if path.exists() {
        bail!("tasklift.toml already exists. Remove it first or edit manually.");
    }
    std::fs::write(&path, config::template(kind))?;
    println!("Created tasklift.toml for {}", kind);
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  tasklift check");
    Ok(0)
}

/// Prints the error with a hint for its class and picks the exit code.
fn report_error(e: &anyhow::Error) -> i32 {
    let Some(provider_error) = e.downcast_ref::<ProviderError>() else {
        eprintln!("{} {:#}", console::style("error:").red(), e);
        return 1;
    };
    let (code, hint) = match provider_error.class() {
        ErrorClass::BadConfig => (2, "fix the configuration file"),
        ErrorClass::NeedsSetup => (3, "one-time setup is missing"),
        ErrorClass::QuotaOrPermissions => (4, "check quotas and IAM permissions"),
        ErrorClass::ProvisioningFailed => (9, "the environment failed while starting"),
        ErrorClass::TimedOut => (5, "the environment did not become ready in time"),
        ErrorClass::CommandFailed => (6, "the remote side failed"),
        ErrorClass::NotFound => (7, "the session or environment no longer exists"),
        ErrorClass::Transient => (8, "transient failure, retrying may help"),
    };
    eprintln!("{} {}", console::style("error:").red(), provider_error);
    if let ProviderError::SetupRequired { remediation, .. } = provider_error {
        eprintln!("  {}", remediation);
    }
    eprintln!("  ({})", console::style(hint).dim());
    code
}
