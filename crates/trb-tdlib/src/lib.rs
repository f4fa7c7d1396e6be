//! Platform client adapter over the client library's JSON bridge.
//!
//! The bridge executable wraps the vendor client library and speaks
//! line-delimited JSON on stdio: one request object per line in, one
//! response or push-update object per line out. Responses echo the
//! `@extra` correlation id of their request; objects without `@extra` are
//! push updates.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use trb_core::client::port::{ClientApi, ClientFactory};
use trb_core::client::types::{
    AuthPhase, ClientEvent, ClientRequest, ClientResponse, ForwardInfo, ForwardOrigin,
    FormattedText, InboundMessage, Keyboard, MessageContent, TextEntity,
};
use trb_core::domain::{ChatId, MessageId, UserId};
use trb_core::{Error, Result};

/// Spawns one bridge process per account.
pub struct BridgeFactory {
    bridge_path: PathBuf,
}

impl BridgeFactory {
    pub fn new(bridge_path: PathBuf) -> Self {
        Self { bridge_path }
    }
}

#[async_trait]
impl ClientFactory for BridgeFactory {
    async fn open(
        &self,
        key: &str,
    ) -> Result<(Arc<dyn ClientApi>, mpsc::UnboundedReceiver<ClientEvent>)> {
        let mut child = Command::new(&self.bridge_path)
            .arg("--account")
            .arg(key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::External("bridge stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("bridge stdout was not captured".to_string()))?;
        let stderr = child.stderr.take();

        let client = Arc::new(BridgeClient {
            key: key.to_string(),
            stdin: tokio::sync::Mutex::new(stdin),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            child: Mutex::new(Some(child)),
            cancel: CancellationToken::new(),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Drain stderr so the bridge never blocks on a full pipe.
        if let Some(stderr) = stderr {
            let key = key.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(account = %key, %line, "bridge stderr");
                }
            });
        }

        let reader = client.clone();
        tokio::spawn(async move {
            reader.read_loop(stdout, events_tx).await;
        });

        Ok((client, events_rx))
    }
}

struct BridgeClient {
    key: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<ClientResponse>>>>,
    next_id: AtomicU64,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
}

impl BridgeClient {
    async fn read_loop(
        self: Arc<Self>,
        stdout: tokio::process::ChildStdout,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!(account = %self.key, error = %e, "bridge read failed");
                        break;
                    }
                },
            };

            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    error!(account = %self.key, error = %e, "bridge sent malformed json");
                    continue;
                }
            };

            match value.get("@extra").and_then(Value::as_u64) {
                Some(id) => {
                    let sender = self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(parse_response(&value));
                        }
                        None => debug!(account = %self.key, id, "late response dropped"),
                    }
                }
                None => {
                    if let Some(event) = parse_update(&value) {
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                }
            }
        }
        // Whoever is still waiting gets a closed-channel error.
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
        debug!(account = %self.key, "bridge reader finished");
    }
}

#[async_trait]
impl ClientApi for BridgeClient {
    async fn submit(&self, req: ClientRequest) -> Result<ClientResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut payload = request_to_json(&req);
        payload["@extra"] = json!(id);

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let mut line = payload.to_string();
        line.push('\n');
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                return Err(Error::Io(e));
            }
        }

        rx.await
            .map_err(|_| Error::External("bridge closed before responding".to_string()))?
    }

    fn close(&self) {
        self.cancel.cancel();
        let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = guard.as_mut() {
            if let Err(e) = child.start_kill() {
                warn!(account = %self.key, error = %e, "bridge kill failed");
            }
        }
        guard.take();
    }
}

// -------------------------------------------------------------- encoding

fn formatted_to_json(text: &FormattedText) -> Value {
    json!({
        "@type": "formattedText",
        "text": text.text,
        "entities": text.entities.iter().map(|e| json!({
            "@type": "textEntity",
            "offset": e.offset,
            "length": e.length,
            "type": {"@type": e.kind},
        })).collect::<Vec<_>>(),
    })
}

fn remote_file(file_id: &str) -> Value {
    json!({"@type": "inputFileRemote", "id": file_id})
}

fn content_to_json(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text { text } => json!({
            "@type": "inputMessageText",
            "text": formatted_to_json(text),
            "clear_draft": true,
        }),
        MessageContent::Photo { file_id, caption } => json!({
            "@type": "inputMessagePhoto",
            "photo": remote_file(file_id),
            "caption": formatted_to_json(caption),
        }),
        MessageContent::Animation {
            file_id,
            duration,
            width,
            height,
            caption,
        } => json!({
            "@type": "inputMessageAnimation",
            "animation": remote_file(file_id),
            "duration": duration,
            "width": width,
            "height": height,
            "caption": formatted_to_json(caption),
        }),
        MessageContent::Video {
            file_id,
            duration,
            width,
            height,
            supports_streaming,
            caption,
        } => json!({
            "@type": "inputMessageVideo",
            "video": remote_file(file_id),
            "duration": duration,
            "width": width,
            "height": height,
            "supports_streaming": supports_streaming,
            "caption": formatted_to_json(caption),
        }),
        MessageContent::Document { file_id, caption } => json!({
            "@type": "inputMessageDocument",
            "document": remote_file(file_id),
            "caption": formatted_to_json(caption),
        }),
        // Never sent outbound; encoded defensively as plain text.
        MessageContent::Contact { phone } => json!({
            "@type": "inputMessageText",
            "text": {"@type": "formattedText", "text": phone, "entities": []},
        }),
        MessageContent::Unsupported { kind } => json!({
            "@type": "inputMessageText",
            "text": {"@type": "formattedText", "text": kind, "entities": []},
        }),
    }
}

fn keyboard_to_json(keyboard: &Keyboard) -> Value {
    json!({
        "@type": "replyMarkupShowKeyboard",
        "one_time": true,
        "resize_keyboard": true,
        "personal": true,
        "rows": keyboard.rows.iter().map(|row| {
            row.iter().map(|button| {
                let kind = if button.request_phone {
                    "keyboardButtonTypeRequestPhoneNumber"
                } else {
                    "keyboardButtonTypeText"
                };
                json!({
                    "@type": "keyboardButton",
                    "text": button.label,
                    "type": {"@type": kind},
                })
            }).collect::<Vec<_>>()
        }).collect::<Vec<_>>(),
    })
}

fn request_to_json(req: &ClientRequest) -> Value {
    match req {
        ClientRequest::SetParameters(p) => json!({
            "@type": "setTdlibParameters",
            "database_directory": p.database_directory,
            "api_id": p.api_id,
            "api_hash": p.api_hash,
            "system_language_code": p.system_language_code,
            "device_model": p.device_model,
            "system_version": p.system_version,
            "application_version": p.application_version,
            "use_message_database": true,
            "use_secret_chats": true,
            "enable_storage_optimizer": true,
        }),
        ClientRequest::CheckEncryptionKey => json!({
            "@type": "checkDatabaseEncryptionKey",
        }),
        ClientRequest::SubmitPhoneNumber { phone } => json!({
            "@type": "setAuthenticationPhoneNumber",
            "phone_number": phone,
        }),
        ClientRequest::SubmitBotToken { token } => json!({
            "@type": "checkAuthenticationBotToken",
            "token": token,
        }),
        ClientRequest::SubmitCode { code } => json!({
            "@type": "checkAuthenticationCode",
            "code": code,
        }),
        ClientRequest::SubmitPassword { password } => json!({
            "@type": "checkAuthenticationPassword",
            "password": password,
        }),
        ClientRequest::GetChat { chat_id } => json!({
            "@type": "getChat",
            "chat_id": chat_id.0,
        }),
        ClientRequest::GetUser { user_id } => json!({
            "@type": "getUser",
            "user_id": user_id.0,
        }),
        ClientRequest::GetMe => json!({"@type": "getMe"}),
        ClientRequest::SendMessage {
            chat_id,
            content,
            keyboard,
        } => {
            let mut value = json!({
                "@type": "sendMessage",
                "chat_id": chat_id.0,
                "input_message_content": content_to_json(content),
            });
            if let Some(keyboard) = keyboard {
                value["reply_markup"] = keyboard_to_json(keyboard);
            }
            value
        }
        ClientRequest::AddProxy {
            host,
            port,
            user,
            password,
        } => json!({
            "@type": "addProxy",
            "server": host,
            "port": port,
            "enable": true,
            "type": {
                "@type": "proxyTypeSocks5",
                "username": user,
                "password": password,
            },
        }),
        ClientRequest::LogOut => json!({"@type": "logOut"}),
    }
}

// -------------------------------------------------------------- decoding

fn str_of(value: &Value, key: &str) -> String {
    value.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn i64_of(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or_default()
}

fn parse_response(value: &Value) -> Result<ClientResponse> {
    match value.get("@type").and_then(Value::as_str).unwrap_or("") {
        "ok" => Ok(ClientResponse::Ok),
        "error" => Err(Error::Platform {
            code: i64_of(value, "code") as i32,
            message: str_of(value, "message"),
        }),
        "chat" => Ok(ClientResponse::Chat {
            chat_id: ChatId(i64_of(value, "id")),
            title: str_of(value, "title"),
        }),
        "user" => Ok(ClientResponse::User {
            user_id: UserId(i64_of(value, "id")),
            username: str_of(value, "username"),
            first_name: str_of(value, "first_name"),
            last_name: str_of(value, "last_name"),
        }),
        "message" => Ok(ClientResponse::Message {
            id: MessageId(i64_of(value, "id")),
        }),
        other => Err(Error::External(format!(
            "unexpected bridge response: {other}"
        ))),
    }
}

fn parse_update(value: &Value) -> Option<ClientEvent> {
    match value.get("@type").and_then(Value::as_str)? {
        "updateAuthorizationState" => {
            let state = value
                .get("authorization_state")?
                .get("@type")
                .and_then(Value::as_str)?;
            Some(ClientEvent::AuthStateChanged(parse_auth_phase(state)))
        }
        "updateNewMessage" => {
            let message = value.get("message")?;
            Some(ClientEvent::NewMessage(parse_message(message)))
        }
        _ => None,
    }
}

fn parse_auth_phase(state: &str) -> AuthPhase {
    match state {
        "authorizationStateWaitTdlibParameters" => AuthPhase::WaitParameters,
        "authorizationStateWaitEncryptionKey" => AuthPhase::WaitEncryptionKey,
        "authorizationStateWaitPhoneNumber" => AuthPhase::WaitPhoneNumber,
        "authorizationStateWaitCode" => AuthPhase::WaitCode,
        "authorizationStateWaitPassword" => AuthPhase::WaitPassword,
        "authorizationStateReady" => AuthPhase::Ready,
        "authorizationStateLoggingOut" => AuthPhase::LoggingOut,
        "authorizationStateClosing" => AuthPhase::Closing,
        "authorizationStateClosed" => AuthPhase::Closed,
        other => AuthPhase::Other(other.to_string()),
    }
}

fn parse_formatted(value: &Value) -> FormattedText {
    FormattedText {
        text: str_of(value, "text"),
        entities: value
            .get("entities")
            .and_then(Value::as_array)
            .map(|entities| {
                entities
                    .iter()
                    .map(|e| TextEntity {
                        offset: i64_of(e, "offset").max(0) as usize,
                        length: i64_of(e, "length").max(0) as usize,
                        kind: e
                            .get("type")
                            .map(|t| str_of(t, "@type"))
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn first_photo_file_id(photo: &Value) -> String {
    photo
        .get("sizes")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.first())
        .map(|size| remote_id(size.get("photo")))
        .unwrap_or_default()
}

fn remote_id(file: Option<&Value>) -> String {
    file.and_then(|f| f.get("remote"))
        .map(|r| str_of(r, "id"))
        .unwrap_or_default()
}

fn parse_content(content: &Value) -> MessageContent {
    let kind = content.get("@type").and_then(Value::as_str).unwrap_or("");
    match kind {
        "messageText" => MessageContent::Text {
            text: parse_formatted(content.get("text").unwrap_or(&Value::Null)),
        },
        "messagePhoto" => MessageContent::Photo {
            file_id: first_photo_file_id(content.get("photo").unwrap_or(&Value::Null)),
            caption: parse_formatted(content.get("caption").unwrap_or(&Value::Null)),
        },
        "messageAnimation" => {
            let animation = content.get("animation").unwrap_or(&Value::Null);
            MessageContent::Animation {
                file_id: remote_id(animation.get("animation")),
                duration: i64_of(animation, "duration") as i32,
                width: i64_of(animation, "width") as i32,
                height: i64_of(animation, "height") as i32,
                caption: parse_formatted(content.get("caption").unwrap_or(&Value::Null)),
            }
        }
        "messageVideo" => {
            let video = content.get("video").unwrap_or(&Value::Null);
            MessageContent::Video {
                file_id: remote_id(video.get("video")),
                duration: i64_of(video, "duration") as i32,
                width: i64_of(video, "width") as i32,
                height: i64_of(video, "height") as i32,
                supports_streaming: video
                    .get("supports_streaming")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                caption: parse_formatted(content.get("caption").unwrap_or(&Value::Null)),
            }
        }
        "messageDocument" => {
            let document = content.get("document").unwrap_or(&Value::Null);
            MessageContent::Document {
                file_id: remote_id(document.get("document")),
                caption: parse_formatted(content.get("caption").unwrap_or(&Value::Null)),
            }
        }
        "messageContact" => MessageContent::Contact {
            phone: content
                .get("contact")
                .map(|c| str_of(c, "phone_number"))
                .unwrap_or_default(),
        },
        other => MessageContent::Unsupported {
            kind: other.to_string(),
        },
    }
}

fn parse_forward(value: &Value) -> Option<ForwardInfo> {
    let info = value.get("forward_info")?;
    let origin = info.get("origin")?;
    let origin = match origin.get("@type").and_then(Value::as_str)? {
        "messageForwardOriginChannel" => ForwardOrigin::Channel {
            chat_id: ChatId(i64_of(origin, "chat_id")),
        },
        "messageForwardOriginUser" => ForwardOrigin::User {
            user_id: UserId(i64_of(origin, "sender_user_id")),
        },
        _ => ForwardOrigin::Hidden,
    };
    Some(ForwardInfo {
        origin,
        date: i64_of(info, "date"),
    })
}

/// Bot command tagged by the platform: the span of the first
/// `textEntityTypeBotCommand` entity, trimmed of an `@botname` suffix.
fn parse_command(content: &MessageContent) -> Option<String> {
    let MessageContent::Text { text } = content else {
        return None;
    };
    let entity = text
        .entities
        .iter()
        .find(|e| e.kind == "textEntityTypeBotCommand")?;
    let chars: Vec<char> = text.text.chars().collect();
    if entity.offset + entity.length > chars.len() {
        return None;
    }
    let raw: String = chars[entity.offset..entity.offset + entity.length]
        .iter()
        .collect();
    Some(raw.split('@').next().unwrap_or("").to_string())
}

fn parse_message(value: &Value) -> InboundMessage {
    let content = parse_content(value.get("content").unwrap_or(&Value::Null));
    let command = parse_command(&content);
    InboundMessage {
        id: MessageId(i64_of(value, "id")),
        chat_id: ChatId(i64_of(value, "chat_id")),
        sender_id: UserId(i64_of(value, "sender_user_id")),
        date: i64_of(value, "date"),
        forward: parse_forward(value),
        content,
        command,
    }
}
