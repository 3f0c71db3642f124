use crate::api::{ApiError, PlatformClient};
use crate::config::{Config, ConfigError};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use std::io::{self, BufRead, Write};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("input error: {0}")]
    Input(#[from] io::Error),
    #[error("login cancelled")]
    Cancelled,
}

/// Token lifecycle on top of the stored config.
pub struct AuthManager<'a> {
    config: &'a mut Config,
}

impl<'a> AuthManager<'a> {
    pub fn new(config: &'a mut Config) -> Self {
        Self { config }
    }

    pub fn is_authenticated(&self) -> bool {
        self.config.is_configured()
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), AuthError> {
        let client = PlatformClient::new(&*self.config, "")?;
        let token = client.login(username, password).await?;
        self.config.set("token", token);
        self.config.set("username", username);
        self.config.save()?;
        info!("login_ok: {username}");
        Ok(())
    }

    pub async fn verify(&self) -> Result<bool, AuthError> {
        if !self.is_authenticated() {
            return Ok(false);
        }
        let client = PlatformClient::new(&*self.config, "")?;
        Ok(client.verify_token().await?)
    }

    pub async fn refresh(&mut self) -> Result<(), AuthError> {
        let client = PlatformClient::new(&*self.config, "")?;
        let token = client.refresh_token().await?;
        self.config.set("token", token);
        self.config.save()?;
        info!("token_refreshed");
        Ok(())
    }

    pub fn logout(&mut self) -> Result<(), AuthError> {
        self.config.clear_credentials();
        self.config.save()?;
        info!("logout");
        Ok(())
    }
}

pub fn prompt_line(label: &str) -> Result<String, AuthError> {
    let mut stdout = io::stdout();
    write!(stdout, "{label}")?;
    stdout.flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Reads a password without echo. Must not be called from inside the
/// async prompt loop, which owns stdin.
pub fn prompt_password(label: &str) -> Result<String, AuthError> {
    let mut stdout = io::stdout();
    write!(stdout, "{label}")?;
    stdout.flush()?;
    terminal::enable_raw_mode()?;
    let result = read_hidden();
    let _ = terminal::disable_raw_mode();
    writeln!(stdout)?;
    result
}

fn read_hidden() -> Result<String, AuthError> {
    let mut password = String::new();
    loop {
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = event::read()?
        else {
            continue;
        };
        if kind == KeyEventKind::Release {
            continue;
        }
        match code {
            KeyCode::Enter => return Ok(password),
            KeyCode::Esc => return Err(AuthError::Cancelled),
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(AuthError::Cancelled)
            }
            KeyCode::Backspace => {
                password.pop();
            }
            KeyCode::Char(ch) => password.push(ch),
            _ => {}
        }
    }
}
