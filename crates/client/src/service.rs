use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{multipart, Client, Response};
use serde::de::DeserializeOwned;
use shared::error::{ClientError, StreamError};
use shared::protocol::{
    Ack, ChatReply, ChatRequest, ErrorBody, FileInfo, FileList, UploadReceipt,
};
use shared::settings::{ServiceSettings, SettingsUpdate};

use crate::session::TurnUpdate;
use crate::stream::{decode_stream, EventStream};

/// Streaming responses can run for minutes, so this client has no total
/// timeout. Plain requests set their own.
static SHARED_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(2)
        .no_proxy()
        .build()
        .unwrap_or_else(|_| Client::new())
});

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Ingestion embeds every chunk before answering.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP client for the local document Q&A service.
#[derive(Clone)]
pub struct ServiceClient {
    http: Client,
    base: String,
    idle_timeout: Option<Duration>,
}

impl ServiceClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: SHARED_HTTP.clone(),
            base: base_url.trim_end_matches('/').to_string(),
            idle_timeout: None,
        }
    }

    /// Abort a streamed answer when no bytes arrive for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn health(&self) -> bool {
        match self
            .http
            .get(self.url("/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Open `POST /chat/stream` and return the decoded event stream.
    pub async fn chat_stream(&self, message: &str) -> Result<EventStream, StreamError> {
        let resp = self
            .http
            .post(self.url("/chat/stream"))
            .json(&ChatRequest {
                message: message.to_string(),
            })
            .send()
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let detail = error_detail(resp).await;
            return Err(StreamError::Transport(format!("{}: {}", status, detail)));
        }
        Ok(decode_stream(resp.bytes_stream(), self.idle_timeout))
    }

    /// Run one streamed turn, reporting every update to `emit` in arrival
    /// order. Always ends with a closing update: a terminal event, `Ended`
    /// or `Failed`.
    pub async fn stream_turn(&self, message: &str, mut emit: impl FnMut(TurnUpdate)) {
        let mut events = match self.chat_stream(message).await {
            Ok(events) => events,
            Err(e) => {
                emit(TurnUpdate::Failed(e));
                return;
            }
        };
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    emit(TurnUpdate::Event(event));
                    if terminal {
                        return;
                    }
                }
                Err(e) => {
                    emit(TurnUpdate::Failed(e));
                    return;
                }
            }
        }
        emit(TurnUpdate::Ended);
    }

    /// Non-streaming `POST /chat`.
    pub async fn chat(&self, message: &str) -> Result<ChatReply, ClientError> {
        let req = self.http.post(self.url("/chat")).json(&ChatRequest {
            message: message.to_string(),
        });
        self.send(req, REQUEST_TIMEOUT).await
    }

    /// Upload a document for ingestion as multipart field `file`.
    pub async fn upload(&self, path: &Path) -> Result<UploadReceipt, ClientError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ClientError::File {
            path: path.display().to_string(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        tracing::info!("Uploading {} ({} bytes)", name, bytes.len());
        let form = multipart::Form::new().part("file", multipart::Part::bytes(bytes).file_name(name));
        let req = self.http.post(self.url("/upload")).multipart(form);
        self.send(req, UPLOAD_TIMEOUT).await
    }

    /// Re-ingest everything in the knowledge base directory.
    pub async fn refresh(&self) -> Result<Ack, ClientError> {
        self.send(self.http.post(self.url("/refresh")), UPLOAD_TIMEOUT)
            .await
    }

    pub async fn clear_database(&self) -> Result<Ack, ClientError> {
        self.send(self.http.post(self.url("/clear-database")), REQUEST_TIMEOUT)
            .await
    }

    /// Reset the service's conversation memory.
    pub async fn clear_memory(&self) -> Result<Ack, ClientError> {
        self.send(self.http.post(self.url("/clear-memory")), REQUEST_TIMEOUT)
            .await
    }

    /// Search uploaded file names. An empty query lists everything.
    pub async fn search_files(&self, query: &str) -> Result<Vec<FileInfo>, ClientError> {
        let req = self
            .http
            .get(self.url("/files/search"))
            .query(&[("query", query)]);
        let list: FileList = self.send(req, REQUEST_TIMEOUT).await?;
        Ok(list.files)
    }

    /// Address of an uploaded file, for opening in the system viewer.
    pub fn file_url(&self, name: &str) -> String {
        match url::Url::parse(&self.base) {
            Ok(mut url) => {
                if let Ok(mut segments) = url.path_segments_mut() {
                    segments.pop_if_empty().push("files").push(name);
                }
                url.to_string()
            }
            Err(_) => format!("{}/files/{}", self.base, name),
        }
    }

    pub async fn settings(&self) -> Result<ServiceSettings, ClientError> {
        self.send(self.http.get(self.url("/settings")), REQUEST_TIMEOUT)
            .await
    }

    /// Send only the changed fields; the service returns the merged result.
    pub async fn update_settings(
        &self,
        update: &SettingsUpdate,
    ) -> Result<ServiceSettings, ClientError> {
        let req = self.http.post(self.url("/settings")).json(update);
        self.send(req, REQUEST_TIMEOUT).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let resp = req
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;
        decode(resp).await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            detail: error_detail(resp).await,
        });
    }
    let body = resp
        .bytes()
        .await
        .map_err(|e| ClientError::Request(e.to_string()))?;
    serde_json::from_slice(&body).map_err(|e| ClientError::Decode(e.to_string()))
}

/// Pull the `detail` text out of an error response, falling back to the raw body.
async fn error_detail(resp: Response) -> String {
    let reason = resp
        .status()
        .canonical_reason()
        .unwrap_or("error")
        .to_string();
    match resp.text().await {
        Ok(text) => match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => body.text(),
            Err(_) if text.trim().is_empty() => reason,
            Err(_) => text,
        },
        Err(_) => reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ChatSession, TurnOutcome};
    use crate::test_server::{serve_once, Reply};
    use shared::protocol::{Role, SourceDescriptor, StreamEvent};

    const HELLO_STREAM: &str = concat!(
        "data: {\"type\":\"sources\",\"sources\":[{\"source\":\"a.pdf\",\"path\":\"/x/a.pdf\"}]}\n",
        "data: {\"type\":\"token\",\"content\":\"Hi\"}\n",
        "data: {\"type\":\"token\",\"content\":\" there\"}\n",
        "data: {\"type\":\"done\"}\n",
    );

    async fn run_turn(chunks: Vec<Vec<u8>>) -> ChatSession {
        let (addr, request) = serve_once(Reply::ok_chunks(chunks)).await;
        let client = ServiceClient::new(&format!("http://{}", addr));

        let mut session = ChatSession::new();
        let turn = session.begin_turn("hello").unwrap();
        let mut outcome = None;
        client
            .stream_turn("hello", |update| {
                if let Some(o) = session.apply(turn, update) {
                    outcome = Some(o);
                }
            })
            .await;

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /chat/stream"));
        assert!(request.contains("{\"message\":\"hello\"}"));
        assert!(outcome.is_some());
        session
    }

    fn assert_hello_answer(session: &ChatSession) {
        let msgs = session.messages();
        assert_eq!(msgs.len(), 2);
        let reply = &msgs[1];
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, "Hi there");
        assert_eq!(
            reply.sources,
            Some(vec![SourceDescriptor {
                name: "a.pdf".into(),
                locator: "/x/a.pdf".into(),
                page: None,
            }])
        );
        assert!(!reply.is_thinking);
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn streamed_answer_lands_in_the_session() {
        let session = run_turn(vec![HELLO_STREAM.as_bytes().to_vec()]).await;
        assert_hello_answer(&session);
    }

    #[tokio::test]
    async fn single_byte_chunks_give_the_same_answer() {
        let chunks = HELLO_STREAM.bytes().map(|b| vec![b]).collect();
        let session = run_turn(chunks).await;
        assert_hello_answer(&session);
    }

    #[tokio::test]
    async fn error_record_rolls_back_the_placeholder() {
        let session = run_turn(vec![b"data: {\"type\":\"error\",\"error\":\"boom\"}\n".to_vec()]).await;
        let msgs = session.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(session.notices()[0].message, "boom");
    }

    #[tokio::test]
    async fn refused_connection_fails_the_turn() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ServiceClient::new(&format!("http://{}", addr));
        let mut session = ChatSession::new();
        let turn = session.begin_turn("hello").unwrap();
        let mut outcome = None;
        client
            .stream_turn("hello", |u| outcome = session.apply(turn, u))
            .await;
        assert_eq!(outcome, Some(TurnOutcome::RolledBack));
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn stream_ends_at_done_even_if_the_body_continues() {
        let (addr, _request) = serve_once(Reply::ok_chunks(vec![
            b"data: {\"type\":\"done\"}\n".to_vec(),
            b"data: {\"type\":\"token\",\"content\":\"x\"}\n".to_vec(),
        ]))
        .await;
        let client = ServiceClient::new(&format!("http://{}", addr));
        let events: Vec<_> = client.chat_stream("q").await.unwrap().collect().await;
        assert_eq!(events, vec![Ok(StreamEvent::Done)]);
    }

    #[tokio::test]
    async fn error_detail_is_surfaced() {
        let (addr, _request) = serve_once(Reply::status(
            500,
            "{\"detail\":\"Error clearing database: locked\"}",
        ))
        .await;
        let client = ServiceClient::new(&format!("http://{}", addr));
        match client.clear_database().await {
            Err(ClientError::Status { status, detail }) => {
                assert_eq!(status, 500);
                assert_eq!(detail, "Error clearing database: locked");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn search_sends_the_query_and_reads_the_list() {
        let (addr, request) = serve_once(Reply::json(
            "{\"files\":[{\"name\":\"a b.pdf\",\"size\":12,\"type\":\"pdf\"}]}",
        ))
        .await;
        let client = ServiceClient::new(&format!("http://{}", addr));
        let files = client.search_files("a b").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a b.pdf");
        assert_eq!(files[0].kind, "pdf");

        let request = request.await.unwrap();
        assert!(request.starts_with("GET /files/search?query=a+b"));
    }

    #[tokio::test]
    async fn upload_posts_a_multipart_file_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "some notes").unwrap();

        let (addr, request) = serve_once(Reply::json(
            "{\"message\":\"File notes.txt uploaded and processed successfully\",\"details\":{\"filename\":\"notes.txt\",\"file_size\":10,\"text_length\":10,\"chunks_created\":1,\"embeddings_generated\":1}}",
        ))
        .await;
        let client = ServiceClient::new(&format!("http://{}", addr));
        let receipt = client.upload(&path).await.unwrap();
        assert_eq!(receipt.details.map(|d| d.chunks_created), Some(1));

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /upload"));
        assert!(request.contains("name=\"file\"; filename=\"notes.txt\""));
        assert!(request.contains("some notes"));
    }

    #[tokio::test]
    async fn missing_upload_file_is_reported_before_any_request() {
        let client = ServiceClient::new("http://127.0.0.1:9");
        let err = client
            .upload(Path::new("/definitely/not/here.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::File { .. }));
    }

    #[tokio::test]
    async fn settings_update_sends_only_changed_fields() {
        let (addr, request) = serve_once(Reply::json(
            "{\"ollama_base_url\":\"http://localhost:11434\",\"embedding_model\":\"nomic-embed-text\",\"llm_model\":\"llama3\",\"chunk_size\":1500,\"chunk_overlap\":150,\"top_k_chunks\":10}",
        ))
        .await;
        let client = ServiceClient::new(&format!("http://{}", addr));
        let update = SettingsUpdate {
            llm_model: Some("llama3".into()),
            ..Default::default()
        };
        let merged = client.update_settings(&update).await.unwrap();
        assert_eq!(merged.llm_model, "llama3");

        let request = request.await.unwrap();
        assert!(request.ends_with("{\"llm_model\":\"llama3\"}"));
    }

    #[tokio::test]
    async fn plain_chat_returns_answer_and_chunks() {
        let (addr, request) = serve_once(Reply::json(
            "{\"answer\":\"42\",\"sources\":[{\"content\":\"the answer\",\"metadata\":{\"source\":\"a.pdf\"}}]}",
        ))
        .await;
        let client = ServiceClient::new(&format!("http://{}", addr));
        let reply = client.chat("question").await.unwrap();
        assert_eq!(reply.answer, "42");
        assert_eq!(reply.sources.len(), 1);
        assert!(request.await.unwrap().starts_with("POST /chat "));
    }

    #[tokio::test]
    async fn health_reflects_the_status_code() {
        let (addr, _request) = serve_once(Reply::json("{\"status\":\"healthy\"}")).await;
        assert!(ServiceClient::new(&format!("http://{}", addr)).health().await);

        let (addr, _request) = serve_once(Reply::status(503, "")).await;
        assert!(!ServiceClient::new(&format!("http://{}", addr)).health().await);
    }

    #[test]
    fn file_url_escapes_the_name() {
        let client = ServiceClient::new("http://127.0.0.1:8000/");
        assert_eq!(
            client.file_url("my report.pdf"),
            "http://127.0.0.1:8000/files/my%20report.pdf"
        );
    }
}
