pub mod api;
pub mod auth;
pub mod commands;
pub mod config;
pub mod connection;
pub mod logging;
pub mod render;
pub mod repl;
pub mod session;

pub use api::{ApiError, PlatformClient};
pub use config::{Config, ConfigError, ProjectConfig};
pub use connection::{
    ConnectError, Connection, ConnectionError, Dialer, FrameTransport, WsDialer, WsTransport,
};
pub use render::{RenderSink, StreamRenderer, TerminalSink};
pub use session::{Session, SessionError, SessionOptions, TurnOutcome};
