use crate::config::Config;
use async_trait::async_trait;
use cv_core::{decode_base64_text, encode_base64_text, DecodeError};
use cv_sync::{FileTransfer, TransferError};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

pub const USER_AGENT: &str = concat!("CodeVerse-CLI/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("not logged in; run `codeverse login`")]
    NotLoggedIn,
    #[error("unauthorized")]
    Unauthorized,
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("response missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlatformStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub agents_available: Option<u64>,
    #[serde(default)]
    pub active_agents: Option<u64>,
    #[serde(default)]
    pub infrastructure: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl AgentInfo {
    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some("active")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentList {
    #[serde(default)]
    pub agents: Vec<AgentInfo>,
    #[serde(default)]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadBody {
    pub filename: String,
    pub content: String,
    pub path: String,
    pub workspace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadBody {
    pub content: String,
}

#[derive(Debug, Serialize)]
struct LoginBody<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    token: Option<String>,
}

/// Wire body for an upload: content travels base64-encoded.
pub fn encode_upload(relative_path: &str, content: &str, workspace: &str) -> UploadBody {
    let filename = relative_path
        .rsplit('/')
        .next()
        .unwrap_or(relative_path)
        .to_string();
    UploadBody {
        filename,
        content: encode_base64_text(content),
        path: relative_path.to_string(),
        workspace: workspace.to_string(),
    }
}

pub fn decode_download(body: &DownloadBody) -> Result<String, DecodeError> {
    decode_base64_text(&body.content)
}

/// JSON client for the platform's HTTP API.
#[derive(Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
    workspace: String,
}

impl PlatformClient {
    pub fn new(config: &Config, workspace: impl Into<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url().trim_end_matches('/').to_string(),
            token: config.token().map(str::to_string),
            workspace: workspace.into(),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub async fn status(&self) -> Result<PlatformStatus, ApiError> {
        let request = self.authorized(self.http.get(self.url("/api/status")));
        read_json(request.send().await?).await
    }

    pub async fn agents(&self) -> Result<AgentList, ApiError> {
        let request = self.require_token(self.http.get(self.url("/api/agents")))?;
        read_json(request.send().await?).await
    }

    pub async fn upload_file(&self, relative_path: &str, content: &str) -> Result<(), ApiError> {
        let body = encode_upload(relative_path, content, &self.workspace);
        let request = self.require_token(self.http.post(self.url("/api/files/upload")))?;
        let response = request.json(&body).send().await?;
        check_status(response).await?;
        debug!("api_upload: {relative_path}");
        Ok(())
    }

    pub async fn download_file(&self, relative_path: &str) -> Result<String, ApiError> {
        let filename = relative_path.rsplit('/').next().unwrap_or(relative_path);
        let request = self
            .require_token(self.http.get(self.url("/api/files/download")))?
            .query(&[
                ("filename", filename),
                ("path", relative_path),
                ("workspace", self.workspace.as_str()),
            ]);
        let body: DownloadBody = read_json(request.send().await?).await?;
        Ok(decode_download(&body)?)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<String, ApiError> {
        let response = self
            .http
            .post(self.url("/api/auth/login"))
            .json(&LoginBody { username, password })
            .send()
            .await?;
        let body: TokenBody = read_json(response).await?;
        body.token
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::MissingField("token"))
    }

    pub async fn verify_token(&self) -> Result<bool, ApiError> {
        let request = self.require_token(self.http.get(self.url("/api/auth/verify")))?;
        let response = request.send().await?;
        token_verdict(response).await
    }

    pub async fn refresh_token(&self) -> Result<String, ApiError> {
        let request = self.require_token(self.http.post(self.url("/api/auth/refresh")))?;
        let body: TokenBody = read_json(request.send().await?).await?;
        body.token
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::MissingField("token"))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn require_token(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ApiError> {
        let token = self.token.as_deref().ok_or(ApiError::NotLoggedIn)?;
        Ok(request.bearer_auth(token))
    }
}

#[async_trait]
impl FileTransfer for PlatformClient {
    async fn upload(&self, relative_path: &str, content: &str) -> Result<(), TransferError> {
        self.upload_file(relative_path, content)
            .await
            .map_err(|err| match err {
                ApiError::Status { status, .. } if (400..500).contains(&status) => {
                    TransferError::Rejected(err.to_string())
                }
                ApiError::Unauthorized | ApiError::NotLoggedIn => {
                    TransferError::Rejected(err.to_string())
                }
                other => TransferError::Failed(other.to_string()),
            })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ApiError::Unauthorized);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// A rejected token is a plain `false`; any other failure is an error.
async fn token_verdict(response: reqwest::Response) -> Result<bool, ApiError> {
    match check_status(response).await {
        Ok(_) => Ok(true),
        Err(ApiError::Unauthorized) => Ok(false),
        Err(err) => Err(err),
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let response = check_status(response).await?;
    Ok(response.json::<T>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_then_download_is_byte_identical() {
        let content = "fn main() {\n    println!(\"héllo ✓\");\n}\n";
        let upload = encode_upload("src/main.rs", content, "/work/demo");
        assert_eq!(upload.filename, "main.rs");
        assert_eq!(upload.path, "src/main.rs");
        assert_ne!(upload.content, content);

        let download = DownloadBody {
            content: upload.content,
        };
        assert_eq!(decode_download(&download).expect("decode"), content);
    }

    #[test]
    fn upload_body_wire_shape() {
        let body = encode_upload("notes.md", "hi", "ws");
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "filename": "notes.md",
                "content": "aGk=",
                "path": "notes.md",
                "workspace": "ws"
            })
        );
    }

    #[test]
    fn agent_list_tolerates_missing_fields() {
        let list: AgentList = serde_json::from_str(
            r#"{"agents":[{"name":"debugger","status":"active"},{"name":"reviewer"}]}"#,
        )
        .expect("parse");
        assert_eq!(list.agents.len(), 2);
        assert!(list.agents[0].is_active());
        assert!(!list.agents[1].is_active());
        assert_eq!(list.total, None);
    }

    #[test]
    fn client_requires_token_for_protected_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_file(dir.path().join("config.json"));
        let client = PlatformClient::new(&config, "ws").expect("client");
        let request = client.http.get(client.url("/api/agents"));
        assert!(matches!(
            client.require_token(request),
            Err(ApiError::NotLoggedIn)
        ));
        assert_eq!(
            client.url("api/status"),
            "https://userapi-codeverse.ibda.me/api/status"
        );
    }

    fn response(status: u16) -> reqwest::Response {
        let response = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(status)
            .body("{}")
            .expect("response");
        reqwest::Response::from(response)
    }

    #[tokio::test]
    async fn token_verdict_only_treats_auth_failures_as_invalid() {
        assert!(token_verdict(response(200)).await.expect("ok"));
        assert!(!token_verdict(response(401)).await.expect("401"));
        assert!(!token_verdict(response(403)).await.expect("403"));
        let err = token_verdict(response(503)).await.expect_err("503");
        assert!(matches!(err, ApiError::Status { status: 503, .. }));
    }
}
