//! Conversational model client
//!
//! [`ChatModel`] is the seam the dialogue controller talks to. [`SparkChat`]
//! implements it over the streaming chat websocket: it sends the whole
//! history in one request and concatenates the streamed reply until the
//! server marks it complete.

use crate::error::{Result, VoiceError};
use crate::signing::{sign_url, Credentials};
use crate::warmup::{Connector, WarmSlot};
use crate::ws::{self, WsSink, WsStream};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
        }
    }
}

/// A conversational model that answers one query given the prior history.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, history: &[ChatMessage], query: &str) -> Result<String>;

    /// Hint that a request is coming soon. Default does nothing.
    async fn warm(&self) {}
}

/// Parameters of the chat service
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub url: String,
    /// Model domain, e.g. `lite` or `generalv3.5`
    pub domain: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            url: "wss://spark-api.xf-yun.com/v1.1/chat".to_string(),
            domain: "lite".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    header: RequestHeader<'a>,
    parameter: RequestParameter<'a>,
    payload: RequestPayload<'a>,
}

#[derive(Debug, Serialize)]
struct RequestHeader<'a> {
    app_id: &'a str,
    uid: String,
}

#[derive(Debug, Serialize)]
struct RequestParameter<'a> {
    chat: ChatParams<'a>,
}

#[derive(Debug, Serialize)]
struct ChatParams<'a> {
    domain: &'a str,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct RequestPayload<'a> {
    message: RequestMessages<'a>,
}

#[derive(Debug, Serialize)]
struct RequestMessages<'a> {
    text: Vec<&'a ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    header: ResponseHeader,
    #[serde(default)]
    payload: Option<ResponsePayload>,
}

#[derive(Debug, Deserialize)]
struct ResponseHeader {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResponsePayload {
    choices: Choices,
}

#[derive(Debug, Deserialize)]
struct Choices {
    #[serde(default)]
    status: u8,
    #[serde(default)]
    text: Vec<ChoiceText>,
}

#[derive(Debug, Deserialize)]
struct ChoiceText {
    #[serde(default)]
    content: String,
}

/// Opens chat connections.
pub struct ChatConnector {
    url: String,
    credentials: Credentials,
}

/// An open chat socket and when it was opened
pub struct ChatConnection {
    sink: WsSink,
    stream: WsStream,
    opened_at: Instant,
}

#[async_trait]
impl Connector for ChatConnector {
    type Conn = ChatConnection;

    async fn connect(&self) -> Result<ChatConnection> {
        let url = sign_url(&self.url, &self.credentials)?;
        let (sink, stream) = ws::open(&url).await?;
        Ok(ChatConnection {
            sink,
            stream,
            opened_at: Instant::now(),
        })
    }

    fn is_usable(&self, conn: &ChatConnection) -> bool {
        // The chat service hangs up idle sockets after a few seconds.
        conn.opened_at.elapsed() < Duration::from_secs(5)
    }
}

/// Streaming chat client
pub struct SparkChat {
    config: ChatConfig,
    app_id: String,
    system_message: Option<ChatMessage>,
    slot: Mutex<WarmSlot<ChatConnector>>,
}

impl SparkChat {
    pub fn new(config: ChatConfig, credentials: Credentials, warm_max_idle: Duration) -> Self {
        let app_id = credentials.app_id.clone();
        let connector = ChatConnector {
            url: config.url.clone(),
            credentials,
        };
        let system_message = config
            .system_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(|p| ChatMessage::new(Role::System, p));
        Self {
            config,
            app_id,
            system_message,
            slot: Mutex::new(WarmSlot::new("chat", connector, warm_max_idle)),
        }
    }

    fn build_messages<'a>(
        &'a self,
        history: &'a [ChatMessage],
        query: &'a ChatMessage,
    ) -> Vec<&'a ChatMessage> {
        let system = self.system_message.as_ref();
        system.into_iter().chain(history.iter()).chain(std::iter::once(query)).collect()
    }
}

#[async_trait]
impl ChatModel for SparkChat {
    async fn complete(&self, history: &[ChatMessage], query: &str) -> Result<String> {
        let mut conn = self.slot.lock().await.take().await?;

        let query = ChatMessage::new(Role::User, query);
        let request = ChatRequest {
            header: RequestHeader {
                app_id: &self.app_id,
                uid: request_uid(),
            },
            parameter: RequestParameter {
                chat: ChatParams {
                    domain: &self.config.domain,
                    temperature: self.config.temperature,
                    max_tokens: self.config.max_tokens,
                },
            },
            payload: RequestPayload {
                message: RequestMessages {
                    text: self.build_messages(history, &query),
                },
            },
        };
        info!("💬 Asking model ({} history messages)", history.len());
        ws::send_json(&mut conn.sink, &request).await?;

        let reply = read_reply(&mut conn.stream).await;
        let _ = conn.sink.send(Message::Close(None)).await;
        let reply = reply?;
        info!("✅ Model replied ({} chars)", reply.chars().count());
        Ok(reply)
    }

    async fn warm(&self) {
        self.slot.lock().await.prime();
    }
}

/// 32 hex characters, fresh for every request.
fn request_uid() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

/// Collect streamed content until the completion status arrives. A socket
/// that closes early still yields whatever text arrived before it.
async fn read_reply(stream: &mut WsStream) -> Result<String> {
    let mut reply = String::new();

    while let Some(message) = stream.next().await {
        let message = message?;
        if let Message::Close(frame) = &message {
            debug!("Chat socket closed: {:?}", frame);
            break;
        }
        let Some(text) = ws::text_payload(&message) else {
            continue;
        };

        let response: ChatResponse = serde_json::from_str(&text)?;
        if response.header.code != 0 {
            return Err(VoiceError::protocol(response.header.code, response.header.message));
        }
        let Some(payload) = response.payload else {
            continue;
        };
        for choice in &payload.choices.text {
            reply.push_str(&choice.content);
        }
        if payload.choices.status == 2 {
            return Ok(reply);
        }
    }

    if reply.is_empty() {
        Err(VoiceError::ConnectionClosed)
    } else {
        warn!("Chat socket closed before completion, keeping partial reply");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::testing::scripted_server;
    use serde_json::{json, Value};

    fn chunk(content: &str, status: u8) -> String {
        json!({
            "header": {"code": 0, "message": "Success", "sid": "cht000", "status": status},
            "payload": {"choices": {"status": status, "seq": 0, "text": [{"content": content, "role": "assistant", "index": 0}]}}
        })
        .to_string()
    }

    fn client(url: String, system_prompt: Option<&str>) -> SparkChat {
        let config = ChatConfig {
            url,
            system_prompt: system_prompt.map(str::to_string),
            ..Default::default()
        };
        let creds = Credentials {
            app_id: "app".into(),
            api_key: "k".into(),
            api_secret: "s".into(),
        };
        SparkChat::new(config, creds, Duration::from_secs(8))
    }

    #[tokio::test]
    async fn concatenates_streamed_reply() {
        let (url, mut seen) =
            scripted_server(vec![chunk("你好，", 0), chunk("我是助手", 1), chunk("。", 2)], 1).await;
        let chat = client(url, Some("简短回答"));
        let history = vec![
            ChatMessage::new(Role::User, "在吗"),
            ChatMessage::new(Role::Assistant, "在的"),
        ];

        let reply = chat.complete(&history, "你是谁").await.unwrap();
        assert_eq!(reply, "你好，我是助手。");

        let request: Value = serde_json::from_str(&seen.recv().await.unwrap()).unwrap();
        assert_eq!(request["header"]["app_id"], "app");
        assert_eq!(request["header"]["uid"].as_str().unwrap().len(), 32);
        assert_eq!(request["parameter"]["chat"]["domain"], "lite");
        assert_eq!(request["parameter"]["chat"]["max_tokens"], 1024);
        let text = request["payload"]["message"]["text"].as_array().unwrap();
        let roles: Vec<&str> = text.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(text[3]["content"], "你是谁");
    }

    #[tokio::test]
    async fn service_code_is_protocol_error() {
        let error = json!({"header": {"code": 10013, "message": "input content audit failed"}}).to_string();
        let (url, _seen) = scripted_server(vec![error], 1).await;
        let chat = client(url, None);

        match chat.complete(&[], "问题").await {
            Err(VoiceError::Protocol { code, .. }) => assert_eq!(code, 10013),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn warm_connection_serves_the_request() {
        let (url, mut seen) = scripted_server(vec![chunk("好", 2)], 1).await;
        let chat = client(url, None);
        chat.warm().await;
        assert!(chat.slot.lock().await.is_primed());

        assert_eq!(chat.complete(&[], "hi").await.unwrap(), "好");
        assert!(!chat.slot.lock().await.is_primed());
        assert!(seen.recv().await.is_some());
    }
}
