use crate::aggregator::StoreView;
use crate::error::{CommandError, TransportError};
use crate::notice::Notice;
use async_trait::async_trait;
use chatdesk_core::model::{ConversationKey, DispositionRef, MessageId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use url::Url;

/// Fire-and-confirm operations on the system of record. Their effect reaches
/// the store only through a later push event or poll snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum MutationCommand {
    Transfer {
        message_id: MessageId,
        target_operator: String,
    },
    Tabulate {
        key: ConversationKey,
        disposition: DispositionRef,
    },
    Delete {
        contact: String,
    },
}

impl MutationCommand {
    pub fn name(&self) -> &'static str {
        match self {
            MutationCommand::Transfer { .. } => "transfer",
            MutationCommand::Tabulate { .. } => "tabulate",
            MutationCommand::Delete { .. } => "delete",
        }
    }

    /// Whether the command still refers to something present in `view`.
    fn targets_known(&self, view: &StoreView) -> bool {
        match self {
            MutationCommand::Transfer { message_id, .. } => {
                view.groups.iter().any(|group| group.contains(message_id))
            }
            MutationCommand::Tabulate { key, .. } => view.find(key).is_some(),
            MutationCommand::Delete { contact } => {
                view.groups.iter().any(|group| &group.key.contact == contact)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandRequest {
    pub request_id: String,
    #[serde(flatten)]
    pub command: MutationCommand,
}

impl CommandRequest {
    pub fn new(command: MutationCommand) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    /// The system of record took the command; confirmation follows later.
    Accepted,
    /// The target no longer exists locally; nothing was sent.
    Skipped,
    Failed(CommandError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub request_id: String,
    pub command: MutationCommand,
    pub status: CommandStatus,
}

impl CommandOutcome {
    pub fn is_accepted(&self) -> bool {
        self.status == CommandStatus::Accepted
    }
}

#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn submit(&self, request: &CommandRequest) -> Result<(), CommandError>;
}

#[derive(Debug, Default, Deserialize)]
struct CommandReply {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<CommandReplyError>,
}

#[derive(Debug, Deserialize)]
struct CommandReplyError {
    code: String,
    #[serde(default)]
    message: String,
}

pub struct HttpCommandSink {
    http: reqwest::Client,
    url: Url,
}

impl HttpCommandSink {
    pub fn new(url: Url, request_timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| TransportError::Http(err.to_string()))?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl CommandSink for HttpCommandSink {
    async fn submit(&self, request: &CommandRequest) -> Result<(), CommandError> {
        let resp = self
            .http
            .post(self.url.clone())
            .json(request)
            .send()
            .await
            .map_err(TransportError::from)?;
        let status = resp.status();
        let text = resp.text().await.map_err(TransportError::from)?;
        let reply = serde_json::from_str::<CommandReply>(&text).unwrap_or_default();

        if let Some(error) = reply.error {
            return Err(CommandError::Rejected {
                code: error.code,
                message: error.message,
            });
        }
        let refused = matches!(reply.status.as_deref(), Some("error" | "rejected"));
        if !status.is_success() || refused {
            return Err(CommandError::Rejected {
                code: format!("http_{}", status.as_u16()),
                message: reply.message.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Sends commands on behalf of the observer and reports each result both to
/// the caller and on the notice channel. Never writes to the store.
#[derive(Clone)]
pub struct CommandDispatcher {
    sink: Option<Arc<dyn CommandSink>>,
    views: watch::Receiver<StoreView>,
    notices: broadcast::Sender<Notice>,
}

impl CommandDispatcher {
    pub fn new(
        sink: Option<Arc<dyn CommandSink>>,
        views: watch::Receiver<StoreView>,
        notices: broadcast::Sender<Notice>,
    ) -> Self {
        Self {
            sink,
            views,
            notices,
        }
    }

    pub async fn dispatch(&self, command: MutationCommand) -> CommandOutcome {
        let request = CommandRequest::new(command);
        let known = request.command.targets_known(&self.views.borrow());
        let status = if !known {
            info!(
                event = "unknown_conversation",
                action = request.command.name(),
                request_id = %request.request_id
            );
            CommandStatus::Skipped
        } else {
            match &self.sink {
                None => CommandStatus::Failed(CommandError::Unconfigured),
                Some(sink) => match sink.submit(&request).await {
                    Ok(()) => {
                        info!(
                            event = "command_accepted",
                            command = request.command.name(),
                            request_id = %request.request_id
                        );
                        CommandStatus::Accepted
                    }
                    Err(err) => {
                        warn!(
                            event = "command_failed",
                            command = request.command.name(),
                            request_id = %request.request_id,
                            error = %err
                        );
                        CommandStatus::Failed(err)
                    }
                },
            }
        };
        let outcome = CommandOutcome {
            request_id: request.request_id,
            command: request.command,
            status,
        };
        let _ = self.notices.send(Notice::Command(outcome.clone()));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use chatdesk_core::wire::{RawMessage, WireMsg};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<CommandRequest>>,
        reject: bool,
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn submit(&self, request: &CommandRequest) -> Result<(), CommandError> {
            self.seen.lock().expect("lock").push(request.clone());
            if self.reject {
                return Err(CommandError::Rejected {
                    code: "invalid_disposition".to_string(),
                    message: "unknown tabulation".to_string(),
                });
            }
            Ok(())
        }
    }

    fn seeded() -> Aggregator {
        let mut aggregator = Aggregator::new(16);
        aggregator.ingest_wire(WireMsg::NewMessage(RawMessage {
            id: Some("1".to_string()),
            contact: Some("A".to_string()),
            channel: Some(json!(1)),
            direction: Some("contact".to_string()),
            timestamp: Some(json!("2026-01-01T10:00:00Z")),
            ..RawMessage::default()
        }));
        aggregator
    }

    fn tabulate(contact: &str) -> MutationCommand {
        MutationCommand::Tabulate {
            key: ConversationKey::new(contact, Some(1)),
            disposition: DispositionRef::new("D1"),
        }
    }

    #[tokio::test]
    async fn accepted_command_does_not_touch_store() {
        let aggregator = seeded();
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = CommandDispatcher::new(
            Some(sink.clone()),
            aggregator.subscribe(),
            aggregator.notice_sender(),
        );
        let mut notices = aggregator.notices();

        let outcome = dispatcher.dispatch(tabulate("A")).await;
        assert!(outcome.is_accepted());
        assert_eq!(sink.seen.lock().expect("lock").len(), 1);
        assert_eq!(aggregator.version(), 1);
        let view = aggregator.view();
        assert!(!view.groups[0].is_closed);
        assert!(matches!(notices.try_recv(), Ok(Notice::Command(ref seen)) if seen == &outcome));
    }

    #[tokio::test]
    async fn unknown_target_is_skipped_without_sending() {
        let aggregator = seeded();
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = CommandDispatcher::new(
            Some(sink.clone()),
            aggregator.subscribe(),
            aggregator.notice_sender(),
        );
        let outcome = dispatcher
            .dispatch(MutationCommand::Delete {
                contact: "ghost".to_string(),
            })
            .await;
        assert_eq!(outcome.status, CommandStatus::Skipped);
        assert!(sink.seen.lock().expect("lock").is_empty());

        let outcome = dispatcher
            .dispatch(MutationCommand::Transfer {
                message_id: MessageId::from("99"),
                target_operator: "op-2".to_string(),
            })
            .await;
        assert_eq!(outcome.status, CommandStatus::Skipped);
    }

    #[tokio::test]
    async fn rejection_is_reported_to_caller() {
        let aggregator = seeded();
        let sink = Arc::new(RecordingSink {
            reject: true,
            ..RecordingSink::default()
        });
        let dispatcher =
            CommandDispatcher::new(Some(sink), aggregator.subscribe(), aggregator.notice_sender());
        let outcome = dispatcher.dispatch(tabulate("A")).await;
        assert!(matches!(
            outcome.status,
            CommandStatus::Failed(CommandError::Rejected { ref code, .. }) if code == "invalid_disposition"
        ));
    }

    #[tokio::test]
    async fn missing_sink_fails_as_unconfigured() {
        let aggregator = seeded();
        let dispatcher =
            CommandDispatcher::new(None, aggregator.subscribe(), aggregator.notice_sender());
        let outcome = dispatcher.dispatch(tabulate("A")).await;
        assert_eq!(outcome.status, CommandStatus::Failed(CommandError::Unconfigured));
    }

    #[test]
    fn request_body_is_tagged() {
        let request = CommandRequest {
            request_id: "r1".to_string(),
            command: MutationCommand::Transfer {
                message_id: MessageId::from("12"),
                target_operator: "op-7".to_string(),
            },
        };
        let value = serde_json::to_value(&request).expect("encode");
        assert_eq!(
            value,
            json!({
                "request_id": "r1",
                "command": "transfer",
                "args": {"message_id": "12", "target_operator": "op-7"}
            })
        );
    }

    async fn serve(router: Router) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        Url::parse(&format!("http://{addr}/commands")).expect("url")
    }

    #[tokio::test]
    async fn http_sink_maps_replies() {
        let router = Router::new().route(
            "/commands",
            post(|Json(body): Json<Value>| async move {
                match body["command"].as_str() {
                    Some("delete") => (StatusCode::OK, Json(json!({"status": "accepted"}))),
                    Some("tabulate") => (
                        StatusCode::OK,
                        Json(json!({"status": "error", "error": {"code": "closed", "message": "already closed"}})),
                    ),
                    _ => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"message": "boom"})),
                    ),
                }
            }),
        );
        let sink = HttpCommandSink::new(serve(router).await, Duration::from_secs(5)).expect("client");

        let delete = CommandRequest::new(MutationCommand::Delete {
            contact: "A".to_string(),
        });
        assert_eq!(sink.submit(&delete).await, Ok(()));

        let rejected = sink.submit(&CommandRequest::new(tabulate("A"))).await;
        assert_eq!(
            rejected,
            Err(CommandError::Rejected {
                code: "closed".to_string(),
                message: "already closed".to_string(),
            })
        );

        let transfer = CommandRequest::new(MutationCommand::Transfer {
            message_id: MessageId::from("1"),
            target_operator: "op".to_string(),
        });
        assert!(matches!(
            sink.submit(&transfer).await,
            Err(CommandError::Rejected { ref code, .. }) if code == "http_500"
        ));
    }
}
