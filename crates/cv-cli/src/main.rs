use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use cv_cli::auth::{prompt_line, prompt_password, AuthManager};
use cv_cli::logging::{init_logging, LogSettings};
use cv_cli::repl::{ctrl_c, read_context_files, run_repl, ReplOptions};
use cv_cli::{
    Config, PlatformClient, ProjectConfig, Session, SessionError, SessionOptions, TerminalSink,
    TurnOutcome, WsDialer,
};
use cv_core::{FileAction, FileChange, SyncAction};
use cv_sync::{watch, Reconciler, WatchOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

#[derive(Parser)]
#[command(name = "codeverse", version)]
#[command(about = "CodeVerse CLI: stream AI agent sessions against your workspace", long_about = None)]
struct Cli {
    /// Config file path (default ~/.codeverse/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store a token
    Login {
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Forget the stored token
    Logout,
    /// Chat with an agent; interactive unless --message is given
    Chat {
        #[arg(short, long)]
        message: Option<String>,
        /// Files to include as context, in order
        #[arg(short = 'f', long = "file")]
        files: Vec<PathBuf>,
        /// Send every message to this agent as a task
        #[arg(short, long, conflicts_with = "files")]
        agent: Option<String>,
        /// Push local edits while the session runs
        #[arg(long)]
        watch: bool,
    },
    /// Run one task with a specific agent
    Agent { name: String, task: String },
    /// List available agents
    Agents,
    /// Show platform status
    Status,
    /// Upload the given files, or the whole current directory
    Sync {
        files: Vec<PathBuf>,
        #[arg(long)]
        watch: bool,
    },
    /// Download one file from the workspace into the current directory
    Pull { path: String },
    /// Create .codeverse.json in the current directory
    Init {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        force: bool,
    },
}

impl Commands {
    fn log_component(&self) -> &'static str {
        match self {
            Commands::Login { .. } | Commands::Logout => "auth",
            Commands::Chat { .. } | Commands::Agent { .. } => "chat",
            Commands::Agents | Commands::Status => "api",
            Commands::Sync { .. } | Commands::Pull { .. } => "sync",
            Commands::Init { .. } => "init",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let component = cli
        .command
        .as_ref()
        .map(Commands::log_component)
        .unwrap_or("cli");
    let _log_guard = init_logging(&LogSettings::from_env(component));

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let mut config = Config::load(config_path);
    let root = std::env::current_dir().context("failed to resolve current directory")?;

    let Some(command) = cli.command else {
        print_welcome();
        return Ok(());
    };

    match command {
        Commands::Login { username, password } => {
            let username = match username {
                Some(username) => username,
                None => prompt_line("Username: ")?,
            };
            let password = match password {
                Some(password) => password,
                None => prompt_password("Password: ")?,
            };
            AuthManager::new(&mut config)
                .login(&username, &password)
                .await
                .context("login failed")?;
            println!("Logged in as {username}.");
        }
        Commands::Logout => {
            AuthManager::new(&mut config).logout()?;
            println!("Logged out.");
        }
        Commands::Chat {
            message,
            files,
            agent,
            watch,
        } => {
            let context = read_context_files(&files).context("failed to read context file")?;
            let client = platform_client(&config, &root)?;
            let mut session = open_session(&config, &client, &root)?;
            match message {
                Some(message) => {
                    let result = match agent {
                        Some(agent) => session.run_agent_task(&agent, &message, ctrl_c()).await,
                        None => session.send_message(&message, context, ctrl_c()).await,
                    };
                    session.close().await;
                    finish_turn(result)?;
                }
                None => {
                    let options = ReplOptions {
                        context,
                        watch,
                        agent,
                        history: Some(config.history_path()),
                    };
                    run_repl(&mut session, &client, options).await?;
                }
            }
        }
        Commands::Agent { name, task } => {
            let client = platform_client(&config, &root)?;
            let mut session = open_session(&config, &client, &root)?;
            let result = session.run_agent_task(&name, &task, ctrl_c()).await;
            session.close().await;
            finish_turn(result)?;
        }
        Commands::Agents => {
            let client = platform_client(&config, &root)?;
            let list = client.agents().await?;
            println!("Available agents:");
            for agent in &list.agents {
                let marker = if agent.is_active() { "●" } else { "○" };
                println!(
                    "  {marker} {} - {}",
                    agent.name,
                    agent.description.as_deref().unwrap_or("No description")
                );
            }
            println!(
                "Total: {} agents",
                list.total.unwrap_or(list.agents.len() as u64)
            );
        }
        Commands::Status => {
            let client = platform_client(&config, &root)?;
            let status = client.status().await?;
            println!("Status: {}", status.status.as_deref().unwrap_or("unknown"));
            println!("Service: {}", status.service.as_deref().unwrap_or("unknown"));
            println!("Version: {}", status.version.as_deref().unwrap_or("unknown"));
            println!("Agents available: {}", status.agents_available.unwrap_or(0));
            for (service, state) in &status.infrastructure {
                println!("  {service}: {state}");
            }
        }
        Commands::Sync {
            files,
            watch: watch_flag,
        } => {
            require_login(&config)?;
            let client = platform_client(&config, &root)?;
            let reconciler = Arc::new(Reconciler::load(&root, Arc::new(client)));
            if files.is_empty() {
                let uploaded = reconciler.sync_directory(&root).await;
                for path in &uploaded {
                    println!("  {path}");
                }
                println!("Synced {} files.", uploaded.len());
            } else {
                let mut uploaded = 0;
                let mut failed = 0;
                for path in &files {
                    match reconciler.sync_file(path).await {
                        Ok(record) => match record.last_action {
                            SyncAction::Uploaded => {
                                uploaded += 1;
                                println!("  {}", record.relative_path);
                            }
                            _ => println!("  {} (unchanged or ignored)", record.relative_path),
                        },
                        Err(err) => {
                            failed += 1;
                            eprintln!("  {}: {err}", path.display());
                        }
                    }
                }
                println!("Synced {uploaded} of {} files.", files.len());
                if failed > 0 {
                    bail!("{failed} file(s) failed to sync");
                }
            }
            if watch_flag {
                let handle = watch(Arc::clone(&reconciler), WatchOptions::default())?;
                println!("Watching for changes (Ctrl+C to stop)...");
                ctrl_c().await;
                handle.stop().await;
            }
        }
        Commands::Pull { path } => {
            require_login(&config)?;
            let client = platform_client(&config, &root)?;
            let content = client.download_file(&path).await?;
            let reconciler = Reconciler::load(&root, Arc::new(client));
            let change = FileChange {
                path: path.clone(),
                action: FileAction::Update,
                content: Some(content),
                is_base64: false,
            };
            let outcome = reconciler.apply_file_change(&change).await?;
            println!("Pulled {}", outcome.relative_path());
        }
        Commands::Init {
            name,
            description,
            force,
        } => {
            if ProjectConfig::load(&root).is_some() && !force {
                bail!("project already initialised; pass --force to overwrite");
            }
            let project = ProjectConfig::new(&root, name, description);
            let path = project.write(&root)?;
            println!("Initialised CodeVerse project {}", project.name);
            println!("Created {}", path.display());
        }
    }
    Ok(())
}

fn print_welcome() {
    println!("CodeVerse CLI {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("  codeverse login    authenticate with your account");
    println!("  codeverse chat     start an interactive session");
    println!("  codeverse agents   list available agents");
    println!("  codeverse --help   show all commands");
}

fn require_login(config: &Config) -> Result<&str> {
    config
        .token()
        .ok_or_else(|| anyhow!("not logged in; run `codeverse login` first"))
}

fn platform_client(config: &Config, root: &Path) -> Result<PlatformClient> {
    config.validate()?;
    Ok(PlatformClient::new(config, root.display().to_string())?)
}

fn open_session(
    config: &Config,
    client: &PlatformClient,
    root: &Path,
) -> Result<Session<WsDialer, TerminalSink>> {
    let token = require_login(config)?;
    let endpoint = Url::parse(config.websocket_url()).context("invalid websocket_url")?;
    let mut options = SessionOptions::new(endpoint, token);
    options.max_retries = config.max_retries();
    let reconciler = Arc::new(Reconciler::load(root, Arc::new(client.clone())));
    Ok(Session::new(
        WsDialer::default(),
        options,
        TerminalSink::new(),
        reconciler,
    ))
}

fn finish_turn(result: Result<TurnOutcome, SessionError>) -> Result<()> {
    match result {
        Ok(TurnOutcome::Completed) => Ok(()),
        Ok(TurnOutcome::Interrupted) => bail!("interrupted"),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn sync_accepts_explicit_files() {
        let cli = Cli::try_parse_from(["codeverse", "sync", "src/app.py", "README.md", "--watch"])
            .expect("parse");
        match cli.command {
            Some(Commands::Sync { files, watch }) => {
                assert_eq!(
                    files,
                    vec![PathBuf::from("src/app.py"), PathBuf::from("README.md")]
                );
                assert!(watch);
            }
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn bare_sync_means_whole_directory() {
        let cli = Cli::try_parse_from(["codeverse", "sync"]).expect("parse");
        assert!(matches!(
            cli.command,
            Some(Commands::Sync { ref files, watch: false }) if files.is_empty()
        ));
    }

    #[test]
    fn chat_agent_cannot_take_context_files() {
        let err = Cli::try_parse_from(["codeverse", "chat", "--agent", "reviewer", "-f", "a.py"])
            .err()
            .expect("conflict");
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);

        let cli = Cli::try_parse_from(["codeverse", "chat", "-a", "reviewer"]).expect("parse");
        assert!(matches!(
            cli.command,
            Some(Commands::Chat { agent: Some(ref agent), message: None, .. }) if agent == "reviewer"
        ));
    }
}
