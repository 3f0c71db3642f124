use crate::connection::{ConnectError, Connection, ConnectionError, Dialer};
use crate::render::{RenderSink, StreamRenderer};
use cv_core::{decode, ConnectionState, ContextEntry, OutboundRequest, StreamEvent, TurnState};
use cv_sync::Reconciler;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("server error: {0}")]
    Remote(String),
}

impl SessionError {
    /// Whether the same session can take another turn afterwards.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SessionError::Closed | SessionError::Connect(ConnectError::Unauthorized)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub endpoint: Url,
    pub token: String,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl SessionOptions {
    pub fn new(endpoint: Url, token: impl Into<String>) -> Self {
        Self {
            endpoint,
            token: token.into(),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

enum FrameFlow {
    Continue,
    Done(Result<TurnOutcome, SessionError>),
}

/// Owns one streaming connection and drives turns over it: each frame is
/// decoded, file changes go to the reconciler, everything else to the
/// renderer. Dropped connections are re-dialled lazily on the next turn.
pub struct Session<D: Dialer, S: RenderSink> {
    dialer: D,
    options: SessionOptions,
    workspace: String,
    connection: Option<Connection<D::Transport>>,
    connection_state: ConnectionState,
    turn_state: TurnState,
    // Interrupted turns whose terminal frame has not arrived yet.
    abandoned_turns: usize,
    closed: bool,
    renderer: StreamRenderer<S>,
    reconciler: Arc<Reconciler>,
}

impl<D: Dialer, S: RenderSink> Session<D, S> {
    pub fn new(dialer: D, options: SessionOptions, sink: S, reconciler: Arc<Reconciler>) -> Self {
        let workspace = reconciler.root().display().to_string();
        Self {
            dialer,
            options,
            workspace,
            connection: None,
            connection_state: ConnectionState::Disconnected,
            turn_state: TurnState::Idle,
            abandoned_turns: 0,
            closed: false,
            renderer: StreamRenderer::new(sink),
            reconciler,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn turn_state(&self) -> TurnState {
        self.turn_state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.connection.as_ref().map(|connection| connection.session_id())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn sink(&self) -> &S {
        self.renderer.sink()
    }

    pub fn sink_mut(&mut self) -> &mut S {
        self.renderer.sink_mut()
    }

    /// Connects if needed, retrying transient failures with backoff.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if self.connection.is_some() {
            return Ok(());
        }
        self.connection_state = ConnectionState::Connecting;
        let mut backoff = self.options.initial_backoff;
        let mut attempt: u32 = 0;
        loop {
            let result = Connection::connect(
                &self.dialer,
                &self.options.endpoint,
                &self.options.token,
                &self.workspace,
            )
            .await;
            match result {
                Ok(connection) => {
                    self.connection = Some(connection);
                    self.connection_state = ConnectionState::Connected;
                    self.abandoned_turns = 0;
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt < self.options.max_retries => {
                    attempt += 1;
                    warn!("session_connect_retry: attempt {attempt}: {err}");
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
                Err(err) => {
                    warn!("session_connect_failed: {err}");
                    self.connection_state = ConnectionState::Disconnected;
                    return Err(SessionError::Connect(err));
                }
            }
        }
    }

    pub async fn send_message<F>(
        &mut self,
        text: &str,
        context: Vec<ContextEntry>,
        interrupt: F,
    ) -> Result<TurnOutcome, SessionError>
    where
        F: Future<Output = ()>,
    {
        let request = OutboundRequest::Chat {
            message: text.to_string(),
            context,
            workspace: self.workspace.clone(),
        };
        self.run_turn(request, interrupt).await
    }

    pub async fn run_agent_task<F>(
        &mut self,
        agent: &str,
        task: &str,
        interrupt: F,
    ) -> Result<TurnOutcome, SessionError>
    where
        F: Future<Output = ()>,
    {
        let request = OutboundRequest::AgentTask {
            agent: agent.to_string(),
            task: task.to_string(),
            workspace: self.workspace.clone(),
        };
        self.run_turn(request, interrupt).await
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.connection_state = ConnectionState::Closing;
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.closed = true;
        self.turn_state = TurnState::Idle;
        self.connection_state = ConnectionState::Disconnected;
    }

    async fn run_turn<F>(
        &mut self,
        request: OutboundRequest,
        interrupt: F,
    ) -> Result<TurnOutcome, SessionError>
    where
        F: Future<Output = ()>,
    {
        self.connect().await?;
        let Some(connection) = self.connection.as_mut() else {
            return Err(SessionError::Connection(ConnectionError::Dropped(
                "not connected".to_string(),
            )));
        };
        if let Err(err) = connection.send(&request).await {
            if matches!(err, ConnectionError::Dropped(_)) {
                self.drop_connection();
            }
            return Err(SessionError::Connection(err));
        }
        info!("turn_started: {}", request.kind());
        self.turn_state = TurnState::AwaitingResponse;

        tokio::pin!(interrupt);
        let outcome = loop {
            let Some(connection) = self.connection.as_mut() else {
                break Err(SessionError::Connection(ConnectionError::Dropped(
                    "not connected".to_string(),
                )));
            };
            let frame = tokio::select! {
                biased;
                _ = &mut interrupt => None,
                frame = connection.next_frame() => Some(frame),
            };
            match frame {
                None => {
                    self.abandoned_turns += 1;
                    self.renderer.interrupt();
                    info!("turn_interrupted: {} pending", self.abandoned_turns);
                    break Ok(TurnOutcome::Interrupted);
                }
                Some(None) => {
                    self.renderer.finish_turn();
                    self.drop_connection();
                    break Err(SessionError::Connection(ConnectionError::Dropped(
                        "closed by server".to_string(),
                    )));
                }
                Some(Some(Err(err))) => {
                    self.renderer.finish_turn();
                    self.drop_connection();
                    break Err(SessionError::Connection(err));
                }
                Some(Some(Ok(text))) => match self.handle_frame(&text).await {
                    FrameFlow::Continue => {}
                    FrameFlow::Done(result) => break result,
                },
            }
        };
        self.turn_state = TurnState::Idle;
        outcome
    }

    async fn handle_frame(&mut self, text: &str) -> FrameFlow {
        let event = match decode(text) {
            Ok(event) => event,
            Err(err) => {
                if self.abandoned_turns == 0 {
                    warn!("frame_decode_failed: {err}");
                    self.renderer.report_decode_error(&err);
                } else {
                    debug!("stale_frame_undecodable: {err}");
                }
                return FrameFlow::Continue;
            }
        };
        if self.abandoned_turns > 0 {
            if event.is_terminal() {
                self.abandoned_turns -= 1;
            }
            debug!("stale_frame_discarded: {}", event.kind());
            return FrameFlow::Continue;
        }
        match event {
            StreamEvent::FileChange(change) => {
                match self.reconciler.apply_file_change(&change).await {
                    Ok(outcome) => self.renderer.file_applied(&change, &outcome),
                    Err(err) => {
                        warn!("pull_failed: {}: {err}", change.path);
                        self.renderer.file_failed(&change, &err.to_string());
                    }
                }
                FrameFlow::Continue
            }
            StreamEvent::Complete => {
                self.renderer.render(&StreamEvent::Complete);
                FrameFlow::Done(Ok(TurnOutcome::Completed))
            }
            StreamEvent::Error { message } => {
                self.renderer.render(&StreamEvent::Error {
                    message: message.clone(),
                });
                FrameFlow::Done(Err(SessionError::Remote(message)))
            }
            other => {
                self.renderer.render(&other);
                FrameFlow::Continue
            }
        }
    }

    fn drop_connection(&mut self) {
        self.connection = None;
        self.abandoned_turns = 0;
        self.connection_state = ConnectionState::Disconnected;
        warn!("session_disconnected");
    }
}

pub fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(next_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(4)), Duration::from_secs(8));
        assert_eq!(next_backoff(Duration::from_secs(8)), MAX_BACKOFF);
        assert_eq!(next_backoff(MAX_BACKOFF), MAX_BACKOFF);
    }

    #[test]
    fn unauthorized_and_closed_are_not_recoverable() {
        assert!(!SessionError::Closed.is_recoverable());
        assert!(!SessionError::Connect(ConnectError::Unauthorized).is_recoverable());
        assert!(SessionError::Remote("boom".to_string()).is_recoverable());
        assert!(SessionError::Connection(ConnectionError::Dropped("eof".to_string()))
            .is_recoverable());
    }
}
