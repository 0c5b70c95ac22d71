//! HTTP API of the agent backend: sessions, tasks, evaluation, uploads.

use std::path::Path;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use agent_convo::{AgentSession, OutputFile, UploadedFile};

use crate::config::ServerConfig;
use crate::error::ApiError;

const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Deserialize)]
struct SessionCreated {
    agent_session_id: String,
}

/// Outcome of `POST /api/evaluate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    server: ServerConfig,
}

impl ApiClient {
    pub fn new(server: ServerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            server,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.server.base_url
    }

    /// WebSocket endpoint streaming one agent session.
    pub fn ws_url(&self, session_id: &str) -> String {
        format!("{}/api/execution/ws/{}", self.server.ws_base_url, session_id)
    }

    /// Where a produced output file can be downloaded.
    pub fn output_file_url(&self, file: &OutputFile) -> String {
        format!(
            "{}/{}",
            self.server.static_file_base_url,
            file.object_name.trim_start_matches('/')
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        debug!(path, "GET");
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        decode(resp).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, ApiError> {
        debug!(path, "POST");
        let mut req = self.http.post(self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(ApiError::from_reqwest)?;
        decode(resp).await
    }

    /// Create an empty user session and return its id.
    pub async fn create_session(&self) -> Result<String, ApiError> {
        let created: SessionCreated = self
            .post_json("/api/execution/agent_session", None)
            .await?;
        info!(session = %created.agent_session_id, "created agent session");
        Ok(created.agent_session_id)
    }

    /// Succeeds only if the session exists on the server.
    pub async fn validate_session(&self, session_id: &str) -> Result<(), ApiError> {
        let _: Value = self
            .post_json(
                "/api/execution/agent_session/validate",
                Some(&json!({ "agent_session_id": session_id })),
            )
            .await?;
        Ok(())
    }

    /// Start a user session seeded from a stored task.
    pub async fn create_session_from_task(&self, task_id: &str) -> Result<String, ApiError> {
        let created: SessionCreated = self
            .post_json(&format!("/api/tasks/{task_id}/agent_session"), None)
            .await?;
        info!(task = task_id, session = %created.agent_session_id, "created session from task");
        Ok(created.agent_session_id)
    }

    /// Benchmark tasks.
    pub async fn fetch_tasks(&self) -> Result<Vec<AgentSession>, ApiError> {
        self.get_json("/api/tasks/").await
    }

    /// Tasks created by users.
    pub async fn fetch_user_tasks(&self) -> Result<Vec<AgentSession>, ApiError> {
        self.get_json("/api/user_tasks").await
    }

    pub async fn fetch_task(&self, task_id: &str) -> Result<AgentSession, ApiError> {
        self.get_json(&format!("/api/tasks/{task_id}")).await
    }

    pub async fn create_task(&self, task: &Value) -> Result<Value, ApiError> {
        self.post_json("/api/tasks/", Some(task)).await
    }

    pub async fn create_user_task(&self, task: &Value) -> Result<Value, ApiError> {
        self.post_json("/api/userTasks", Some(task)).await
    }

    /// Run the evaluation script for a benchmark instance. A failed run is
    /// reported in the result, not as an error.
    pub async fn evaluate_task(&self, instance_id: &str) -> Result<EvaluationResult, ApiError> {
        let resp = self
            .http
            .post(self.url("/api/evaluate"))
            .json(&json!({ "instance_id": instance_id }))
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        decode_body(resp, false).await
    }

    /// Upload a file into the session's workspace as multipart field `file`.
    /// `on_progress` receives the percentage of bytes handed to the transport.
    pub async fn upload_file<F>(
        &self,
        session_id: &str,
        path: &Path,
        mut on_progress: F,
    ) -> Result<UploadedFile, ApiError>
    where
        F: FnMut(u8) + Send + Sync + 'static,
    {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow::anyhow!("Not a file path: {}", path.display()))?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;

        let total = data.len() as u64;
        let chunks: Vec<Vec<u8>> = data.chunks(UPLOAD_CHUNK_BYTES).map(<[u8]>::to_vec).collect();
        let mut sent = 0u64;
        let stream = futures::stream::iter(chunks).map(move |chunk| {
            sent += chunk.len() as u64;
            on_progress(percent(sent, total));
            Ok::<_, std::io::Error>(chunk)
        });

        let part = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(stream),
            total,
        )
        .file_name(file_name.clone());
        let form = reqwest::multipart::Form::new().part("file", part);

        info!(session = session_id, file = %file_name, bytes = total, "uploading file");
        let resp = self
            .http
            .post(self.url(&format!("/api/execution/upload/{session_id}")))
            .multipart(form)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        decode(resp).await
    }

    pub async fn delete_file(&self, session_id: &str, filename: &str) -> Result<(), ApiError> {
        let url = self.url(&format!("/api/execution/upload/{session_id}/{filename}"));
        debug!(%url, "DELETE");
        let resp = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        let _: Value = decode(resp).await?;
        Ok(())
    }
}

fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

/// Non-2xx statuses and bodies carrying `error` become [`ApiError::Status`].
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    decode_body(resp, true).await
}

async fn decode_body<T: DeserializeOwned>(
    resp: reqwest::Response,
    error_field_fails: bool,
) -> Result<T, ApiError> {
    let status = resp.status();
    let text = resp.text().await.map_err(ApiError::from_reqwest)?;
    let body: Value = if text.trim().is_empty() {
        Value::Null
    } else {
        match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(_) if !status.is_success() => {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    message: text,
                });
            }
            Err(e) => return Err(anyhow::anyhow!("Invalid JSON response: {e}").into()),
        }
    };

    if let Some(message) = body.get("error").filter(|_| error_field_fails || !status.is_success()) {
        let message = message
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| message.to_string());
        return Err(ApiError::Status {
            status: status.as_u16(),
            message,
        });
    }
    if !status.is_success() {
        return Err(ApiError::Status {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string(),
        });
    }

    serde_json::from_value(body)
        .map_err(|e| anyhow::anyhow!("Unexpected response shape: {e}").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn client(base_url: &str) -> ApiClient {
        ApiClient::new(ServerConfig::from_file(&crate::config::ServerFileConfig {
            base_url: base_url.to_string(),
            static_file_base_url: "storage".to_string(),
        }))
    }

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let mut request = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });
        (base, task)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..head_end]
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        raw.len() >= head_end + 4 + length
    }

    #[test]
    fn ws_and_output_urls() {
        let api = client("http://127.0.0.1:8000/");
        assert_eq!(api.base_url(), "http://127.0.0.1:8000");
        assert_eq!(api.ws_url("abc"), "ws://127.0.0.1:8000/api/execution/ws/abc");
        let file: OutputFile = serde_json::from_value(json!({
            "id": "o1",
            "filename": "plot.png",
            "object_name": "abc/output/plot.png"
        }))
        .unwrap();
        assert_eq!(
            api.output_file_url(&file),
            "http://127.0.0.1:8000/storage/abc/output/plot.png"
        );
    }

    #[test]
    fn percent_rounds_and_handles_empty() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(3, 3), 100);
    }

    #[tokio::test]
    async fn create_session_posts_and_parses_id() {
        let (base, server) = serve_once("200 OK", r#"{"agent_session_id":"s-42"}"#).await;
        let id = client(&base).create_session().await.unwrap();
        assert_eq!(id, "s-42");
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/execution/agent_session HTTP/1.1"));
    }

    #[tokio::test]
    async fn validate_session_sends_id() {
        let (base, server) = serve_once("200 OK", r#"{"valid":true}"#).await;
        client(&base).validate_session("s-42").await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/execution/agent_session/validate"));
        assert!(request.contains(r#""agent_session_id":"s-42""#));
    }

    #[tokio::test]
    async fn error_body_becomes_status_error() {
        let (base, _server) =
            serve_once("404 Not Found", r#"{"error":"Invalid Agent Session ID"}"#).await;
        match client(&base).validate_session("nope").await {
            Err(ApiError::Status { status, message }) => {
                assert_eq!(status, 404);
                assert_eq!(message, "Invalid Agent Session ID");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_tasks_decodes_sessions() {
        let (base, server) = serve_once(
            "200 OK",
            r#"[{"id":"t1","metadata":{"source":"benchmark","task_inst":"Plot it"}},{"id":"t2"}]"#,
        )
        .await;
        let tasks = client(&base).fetch_tasks().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "t1");
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/tasks/ HTTP/1.1"));
    }

    #[tokio::test]
    async fn upload_reports_progress_to_completion() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"name":"data.csv","size":5,"object_name":"s1/data.csv","source":"user"}"#,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "a,b\n1").unwrap();

        let progress = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = progress.clone();
        let uploaded = client(&base)
            .upload_file("s1", &path, move |p| seen.lock().unwrap().push(p))
            .await
            .unwrap();

        assert_eq!(uploaded.name, "data.csv");
        assert_eq!(progress.lock().unwrap().last(), Some(&100));
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/execution/upload/s1 HTTP/1.1"));
        assert!(request.contains(r#"name="file"; filename="data.csv""#));
    }

    #[tokio::test]
    async fn evaluation_failure_is_a_result() {
        let (base, _server) =
            serve_once("200 OK", r#"{"success":false,"error":"script missing"}"#).await;
        let result = client(&base).evaluate_task("12").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("script missing"));
    }

    #[tokio::test]
    async fn unavailable_server() {
        let api = client("http://127.0.0.1:1");
        assert!(matches!(
            api.create_session().await,
            Err(ApiError::Unavailable)
        ));
    }
}
