//! # Camera WebSocket
//!
//! `GET /ws/camera` upgrades to a WebSocket that plays both external roles
//! of a pipeline: Frame Source (binary frame envelopes in) and Result Sink
//! (JSON messages out).
//!
//! ## Message Flow:
//! 1. Client sends `start_session` with a target language (and optionally a
//!    session id and source language)
//! 2. Client streams binary frame envelopes; each is admitted or dropped
//! 3. Server pushes `translation`, `error` and `pass_status` messages in
//!    frame order as passes finish
//! 4. On an ambiguous detection the client may answer with `resolve_language`
//! 5. `end_session` (or closing the socket) drains the session's pipeline
//!
//! ## Heartbeat:
//! The server pings every 30 seconds and drops clients silent for 60.

use crate::config::AppConfig;
use crate::frame::Frame;
use crate::language::{LanguageTag, SourceLanguage};
use crate::pipeline::{Admission, ErrorKind, ResultSink, SinkEvent, Terminal, PassError};
use crate::session::{CameraSession, SessionError, SessionManager, SessionStatus};
use crate::stages::TranslationResult;
use crate::state::AppState;

use actix::prelude::*;
use actix::WeakAddr;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebSocketMessage {
    #[serde(rename = "start_session")]
    StartSession {
        session_id: Option<String>,
        target_language: String,
        /// `"auto"` or a language tag; defaults to the configured source
        source_language: Option<String>,
    },

    /// Answer to an ambiguous-detection prompt
    #[serde(rename = "resolve_language")]
    ResolveLanguage { source_language: String },

    #[serde(rename = "set_target_language")]
    SetTargetLanguage { target_language: String },

    #[serde(rename = "end_session")]
    EndSession { session_id: Option<String> },

    #[serde(rename = "translation")]
    Translation {
        session_id: String,
        frame_sequence: u64,
        source_text: String,
        translated_text: String,
        source_language: String,
        target_language: String,
        model_version: Option<String>,
        produced_at: DateTime<Utc>,
    },

    #[serde(rename = "pass_status")]
    PassStatus {
        session_id: String,
        frame_sequence: u64,
        status: String,
    },

    #[serde(rename = "session_status")]
    SessionStatus {
        session_id: String,
        status: String,
        message: Option<String>,
    },

    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        session_id: Option<String>,
        frame_sequence: Option<u64>,
        /// The condition persists until an operator intervenes
        #[serde(default)]
        standing: bool,
    },

    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

impl WebSocketMessage {
    fn error(code: &str, message: impl Into<String>, session_id: Option<String>) -> Self {
        WebSocketMessage::Error {
            code: code.to_string(),
            message: message.into(),
            session_id,
            frame_sequence: None,
            standing: false,
        }
    }

    fn translation(session_id: &str, frame_sequence: u64, result: TranslationResult) -> Self {
        WebSocketMessage::Translation {
            session_id: session_id.to_string(),
            frame_sequence,
            source_text: result.request.source_text,
            translated_text: result.translated_text,
            source_language: result.source_language_resolved.to_string(),
            target_language: result.request.target_language.to_string(),
            model_version: result.model_version,
            produced_at: result.produced_at,
        }
    }

    fn pass_error(session_id: &str, error: PassError) -> Self {
        WebSocketMessage::Error {
            code: error.kind.as_str().to_string(),
            message: error.message,
            session_id: Some(session_id.to_string()),
            frame_sequence: error.context.frame_sequence,
            standing: error.standing,
        }
    }

    fn pass_status(session_id: &str, frame_sequence: u64, terminal: Terminal) -> Self {
        WebSocketMessage::PassStatus {
            session_id: session_id.to_string(),
            frame_sequence,
            status: terminal.as_str().to_string(),
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// A sink event raised by the session's pipeline.
#[derive(Message)]
#[rtype(result = "()")]
struct PipelineEvent(SinkEvent);

/// Forwards pipeline reports to the connection's actor.
///
/// Holds a weak address so a lingering pipeline never keeps a closed
/// connection alive.
struct ActorSink {
    addr: WeakAddr<FrameWebSocket>,
}

impl ActorSink {
    fn forward(&self, event: SinkEvent) {
        match self.addr.upgrade() {
            Some(addr) => addr.do_send(PipelineEvent(event)),
            None => debug!("Camera connection gone, dropping pipeline event"),
        }
    }
}

impl ResultSink for ActorSink {
    fn on_result(&self, frame_sequence: u64, result: TranslationResult) {
        self.forward(SinkEvent::Result {
            frame_sequence,
            result,
        });
    }

    fn on_error(&self, error: PassError) {
        self.forward(SinkEvent::Error { error });
    }

    fn on_pass_terminal(&self, frame_sequence: u64, terminal: Terminal) {
        self.forward(SinkEvent::Terminal {
            frame_sequence,
            terminal,
        });
    }
}

pub struct FrameWebSocket {
    sessions: Arc<SessionManager>,
    session: Option<Arc<CameraSession>>,
    /// Configuration as of connection time
    config: AppConfig,
    last_heartbeat: Instant,
}

impl FrameWebSocket {
    pub fn new(app_state: &AppState) -> Self {
        Self {
            sessions: app_state.sessions.clone(),
            session: None,
            config: app_state.get_config(),
            last_heartbeat: Instant::now(),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.session_id.clone())
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &WebSocketMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("Failed to serialize WebSocket message: {}", err),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(code, session = ?self.session_id(), "WebSocket error: {}", message);
        self.send(ctx, &WebSocketMessage::error(code, message, self.session_id()));
    }

    fn handle_start_session(
        &mut self,
        session_id: Option<String>,
        target_language: &str,
        source_language: Option<&str>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) -> Result<(), (&'static str, String)> {
        if let Some(active) = &self.session {
            return Err((
                "session_active",
                format!("session {} is already running on this connection", active.session_id),
            ));
        }

        let mut pipeline_config = self
            .config
            .pipeline_config()
            .map_err(|e| ("config_error", format!("{:#}", e)))?;
        pipeline_config.target_language =
            LanguageTag::parse(target_language).map_err(|e| ("invalid_language", e.to_string()))?;
        if let Some(source) = source_language {
            pipeline_config.source_language = source
                .parse::<SourceLanguage>()
                .map_err(|e| ("invalid_language", e.to_string()))?;
        }

        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let target = pipeline_config.target_language.clone();
        let source = pipeline_config.source_language.clone();
        let sink = Arc::new(ActorSink {
            addr: ctx.address().downgrade(),
        });

        let session = self
            .sessions
            .create_session(Some(session_id.clone()), pipeline_config, sink)
            .map_err(|err| match err {
                SessionError::LimitReached(_) => ("session_limit", err.to_string()),
                SessionError::DuplicateId(_) => ("session_exists", err.to_string()),
                SessionError::Pipeline(_) => ("session_error", err.to_string()),
            })?;
        self.session = Some(session);

        info!(session = %session_id, target = %target, source = %source, "Camera session started");
        self.send(
            ctx,
            &WebSocketMessage::SessionStatus {
                session_id,
                status: "started".to_string(),
                message: Some(format!("Translating {} to {}", source, target)),
            },
        );
        Ok(())
    }

    fn handle_frame(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) -> Result<(), (&'static str, String)> {
        let Some(session) = self.session.clone() else {
            return Err((
                "no_session",
                "Session not started. Send start_session first.".to_string(),
            ));
        };

        let frame = match Frame::decode_envelope(data, self.config.performance.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                session.record_rejected(data.len());
                return Err(("invalid_frame", err.to_string()));
            }
        };

        match session.submit(frame, data.len()) {
            Admission::Admitted {
                frame_sequence,
                superseded,
            } => {
                debug!(session = %session.session_id, frame = frame_sequence, superseded = ?superseded, "Frame admitted");
            }
            Admission::Stale {
                frame_sequence,
                last_admitted,
            } => {
                debug!(session = %session.session_id, frame = frame_sequence, last_admitted, "Stale frame dropped");
                self.send(
                    ctx,
                    &WebSocketMessage::PassStatus {
                        session_id: session.session_id.clone(),
                        frame_sequence,
                        status: "stale".to_string(),
                    },
                );
            }
            Admission::Closed { frame_sequence } => {
                return Err((
                    "session_closed",
                    format!("frame {} arrived after the session closed", frame_sequence),
                ));
            }
        }
        Ok(())
    }

    fn handle_resolve_language(&mut self, source_language: &str, ctx: &mut ws::WebsocketContext<Self>) -> Result<(), (&'static str, String)> {
        let Some(session) = self.session.clone() else {
            return Err(("no_session", "No active session to resolve".to_string()));
        };
        let source = LanguageTag::parse(source_language).map_err(|e| ("invalid_language", e.to_string()))?;

        session.resolve_language(source.clone());
        self.send(
            ctx,
            &WebSocketMessage::SessionStatus {
                session_id: session.session_id.clone(),
                status: SessionStatus::Active.as_str().to_string(),
                message: Some(format!("Source language set to {}", source)),
            },
        );
        Ok(())
    }

    fn handle_set_target(&mut self, target_language: &str, ctx: &mut ws::WebsocketContext<Self>) -> Result<(), (&'static str, String)> {
        let Some(session) = self.session.clone() else {
            return Err(("no_session", "No active session".to_string()));
        };
        let target = LanguageTag::parse(target_language).map_err(|e| ("invalid_language", e.to_string()))?;

        session.pipeline().set_target_language(target.clone());
        self.send(
            ctx,
            &WebSocketMessage::SessionStatus {
                session_id: session.session_id.clone(),
                status: session.status().as_str().to_string(),
                message: Some(format!("Target language set to {}", target)),
            },
        );
        Ok(())
    }

    fn handle_end_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session) = self.session.take() else {
            self.send_error(ctx, "no_session", "No active session to end");
            return;
        };

        let sessions = self.sessions.clone();
        let addr = ctx.address();
        let session_id = session.session_id.clone();
        tokio::spawn(async move {
            sessions.end_session(&session_id).await;
            let ended = WebSocketMessage::SessionStatus {
                session_id,
                status: SessionStatus::Ended.as_str().to_string(),
                message: None,
            };
            if let Ok(json) = serde_json::to_string(&ended) {
                addr.do_send(SendText(json));
            }
        });
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match serde_json::from_str::<WebSocketMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
                return;
            }
        };

        let outcome = match message {
            WebSocketMessage::StartSession {
                session_id,
                target_language,
                source_language,
            } => self.handle_start_session(session_id, &target_language, source_language.as_deref(), ctx),
            WebSocketMessage::ResolveLanguage { source_language } => {
                self.handle_resolve_language(&source_language, ctx)
            }
            WebSocketMessage::SetTargetLanguage { target_language } => {
                self.handle_set_target(&target_language, ctx)
            }
            WebSocketMessage::EndSession { .. } => {
                self.handle_end_session(ctx);
                Ok(())
            }
            WebSocketMessage::Pong { .. } => {
                self.last_heartbeat = Instant::now();
                Ok(())
            }
            WebSocketMessage::Ping { timestamp } => {
                self.last_heartbeat = Instant::now();
                self.send(ctx, &WebSocketMessage::Pong { timestamp });
                Ok(())
            }
            _ => {
                warn!("Received server-bound message type from client");
                Err(("unexpected_message", "message type is not accepted from clients".to_string()))
            }
        };

        if let Err((code, message)) = outcome {
            self.send_error(ctx, code, &message);
        }
    }
}

impl Actor for FrameWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Camera WebSocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session = ?act.session_id(), "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                act.send(ctx, &WebSocketMessage::Ping { timestamp: now_millis() });
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session = ?self.session_id(), "Camera WebSocket connection stopped");

        if let Some(session) = self.session.take() {
            let sessions = self.sessions.clone();
            tokio::spawn(async move {
                sessions.end_session(&session.session_id).await;
            });
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for FrameWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                if let Err((code, message)) = self.handle_frame(&data, ctx) {
                    self.send_error(ctx, code, &message);
                }
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for FrameWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<PipelineEvent> for FrameWebSocket {
    type Result = ();

    fn handle(&mut self, msg: PipelineEvent, ctx: &mut Self::Context) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let session_id = session.session_id.as_str();

        let message = match msg.0 {
            SinkEvent::Result {
                frame_sequence,
                result,
            } => WebSocketMessage::translation(session_id, frame_sequence, result),
            SinkEvent::Error { error } => {
                if error.kind == ErrorKind::DetectionAmbiguous {
                    session.set_status(SessionStatus::AwaitingLanguage);
                }
                WebSocketMessage::pass_error(session_id, error)
            }
            SinkEvent::Terminal {
                frame_sequence,
                terminal,
            } => WebSocketMessage::pass_status(session_id, frame_sequence, terminal),
        };
        self.send(ctx, &message);
    }
}

/// `GET /ws/camera`
pub async fn camera_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        "New camera WebSocket connection request"
    );

    let max_frame_bytes = app_state.get_config().performance.max_frame_bytes;
    ws::WsResponseBuilder::new(FrameWebSocket::new(&app_state), &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PassContext;
    use crate::stages::TranslationRequest;
    use crate::testkit::tag;

    #[test]
    fn test_start_session_parsing() {
        let json = r#"{"type": "start_session", "target_language": "fr"}"#;
        let message: WebSocketMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            message,
            WebSocketMessage::StartSession {
                session_id: None,
                target_language: "fr".to_string(),
                source_language: None,
            }
        );

        let json = r#"{"type": "resolve_language", "source_language": "de"}"#;
        assert!(matches!(
            serde_json::from_str::<WebSocketMessage>(json).unwrap(),
            WebSocketMessage::ResolveLanguage { .. }
        ));
    }

    #[test]
    fn test_translation_message_from_result() {
        let request = TranslationRequest::new("Exit", SourceLanguage::Auto, tag("fr"));
        let result = TranslationResult {
            request,
            translated_text: "Sortie".to_string(),
            source_language_resolved: tag("en"),
            produced_at: Utc::now(),
            model_version: Some("test-1".to_string()),
        };

        let message = WebSocketMessage::translation("cam-1", 7, result);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "translation");
        assert_eq!(json["frame_sequence"], 7);
        assert_eq!(json["translated_text"], "Sortie");
        assert_eq!(json["source_language"], "en");
        assert_eq!(json["target_language"], "fr");
    }

    #[test]
    fn test_pass_error_keeps_kind_and_standing() {
        let context = PassContext::for_frame(3, tag("fr"));
        let mut error = PassError::new(ErrorKind::ModelUnavailable, &context, "en-fr not downloaded");
        error.standing = true;

        let json = serde_json::to_value(WebSocketMessage::pass_error("cam-1", error)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "model_unavailable");
        assert_eq!(json["frame_sequence"], 3);
        assert_eq!(json["standing"], true);
    }

    #[test]
    fn test_pass_status_names() {
        let json = serde_json::to_value(WebSocketMessage::pass_status("cam-1", 2, Terminal::Cancelled)).unwrap();
        assert_eq!(json["status"], "cancelled");

        let json = serde_json::to_value(WebSocketMessage::pass_status("cam-1", 4, Terminal::AwaitingLanguage)).unwrap();
        assert_eq!(json["status"], "awaiting_language");
    }
}
