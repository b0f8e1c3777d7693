//! Telegram bot alert sink
//!
//! One sink per chat id, so each chat has its own ordered queue and a retry
//! never re-sends to chats that already received the message. Transitions
//! carrying a snapshot go out as `sendPhoto` with the message as caption.

use super::AlertSink;
use crate::error::{Error, Result};
use crate::models::{EventTransition, TransitionKind};
use crate::snapshot_store::{content_type, image_extension};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Serialize;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

pub struct TelegramSink {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
    name: String,
}

impl TelegramSink {
    pub fn new(client: reqwest::Client, bot_token: String, chat_id: String) -> Self {
        Self::with_api_base(client, TELEGRAM_API_BASE.to_string(), bot_token, chat_id)
    }

    pub fn with_api_base(
        client: reqwest::Client,
        api_base: String,
        bot_token: String,
        chat_id: String,
    ) -> Self {
        let name = format!("telegram:{}", chat_id);
        Self {
            client,
            api_base,
            bot_token,
            chat_id,
            name,
        }
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// HTML message body for a transition
pub fn format_message(transition: &EventTransition) -> String {
    let event = &transition.event;
    let labels = if event.labels.is_empty() {
        "unknown".to_string()
    } else {
        event.labels.iter().cloned().collect::<Vec<_>>().join(", ")
    };
    let source = escape_html(&event.source_id);
    let labels = escape_html(&labels);
    let confidence = (event.max_confidence * 100.0).round() as i64;

    match transition.kind {
        TransitionKind::Closed => {
            let duration = event.duration_ms().unwrap_or(0) as f64 / 1000.0;
            let end = event.end_time.unwrap_or(transition.at);
            format!(
                "<b>Detection Event Closed</b>\n\
                 Source: <b>{}</b>\n\
                 Detected: <b>{}</b>\n\
                 Max confidence: {}%\n\
                 Duration: {:.1}s\n\
                 Detections: {}\n\
                 Ended: {} UTC",
                source,
                labels,
                confidence,
                duration,
                event.frame_count,
                end.format("%Y-%m-%d %H:%M:%S")
            )
        }
        TransitionKind::Opened | TransitionKind::Extended => format!(
            "<b>Detection Alert</b>\n\
             Source: <b>{}</b>\n\
             Detected: <b>{}</b>\n\
             Confidence: {}%\n\
             Detections: {}\n\
             Time: {} UTC",
            source,
            labels,
            confidence,
            event.frame_count,
            event.start_time.format("%Y-%m-%d %H:%M:%S")
        ),
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, transition: &EventTransition) -> Result<()> {
        let text = format_message(transition);
        let request = match &transition.snapshot {
            Some(snapshot) => {
                let file_name = format!(
                    "{}.{}",
                    transition.event.id,
                    image_extension(snapshot).unwrap_or("jpg")
                );
                let photo = Part::bytes(snapshot.to_vec())
                    .file_name(file_name.clone())
                    .mime_str(content_type(&file_name))
                    .map_err(|e| self.failure(e.to_string()))?;
                let form = Form::new()
                    .text("chat_id", self.chat_id.clone())
                    .text("caption", text)
                    .text("parse_mode", "HTML")
                    .part("photo", photo);
                self.client
                    .post(self.method_url("sendPhoto"))
                    .multipart(form)
            }
            None => self.client.post(self.method_url("sendMessage")).json(&SendMessage {
                chat_id: &self.chat_id,
                text: &text,
                parse_mode: "HTML",
            }),
        };

        // The URL carries the bot token
        let response = request
            .send()
            .await
            .map_err(|e| self.failure(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(self.failure(format!("HTTP {}: {}", status, detail)));
        }
        Ok(())
    }
}

impl TelegramSink {
    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    fn failure(&self, message: String) -> Error {
        Error::NotificationDeliveryFailure {
            sink: self.name.clone(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloseReason, Event};
    use axum::extract::State;
    use axum::http::{header, HeaderMap, StatusCode, Uri};
    use axum::routing::post;
    use axum::Router;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Captured {
        path: String,
        content_type: String,
        body: Bytes,
    }

    type Captures = Arc<Mutex<Vec<Captured>>>;

    async fn capture(
        State(captures): State<(Captures, StatusCode)>,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        captures.0.lock().unwrap().push(Captured {
            path: uri.path().to_string(),
            content_type,
            body,
        });
        captures.1
    }

    /// Local Bot API stand-in answering every method with `status`
    async fn bot_api(status: StatusCode) -> (String, Captures) {
        let captures: Captures = Arc::default();
        let app = Router::new()
            .route("/:bot/:method", post(capture))
            .with_state((captures.clone(), status));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), captures)
    }

    fn sink(api_base: String) -> TelegramSink {
        TelegramSink::with_api_base(reqwest::Client::new(), api_base, "123:abc".into(), "42".into())
    }

    fn event() -> Event {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Event::open(
            "gate<1>",
            start,
            0.876,
            BTreeSet::from(["fight".to_string(), "weapon".to_string()]),
        )
    }

    #[test]
    fn test_opened_message() {
        let transition = EventTransition::new(TransitionKind::Opened, event(), Utc::now());
        let text = format_message(&transition);
        assert!(text.starts_with("<b>Detection Alert</b>"));
        assert!(text.contains("Source: <b>gate&lt;1&gt;</b>"));
        assert!(text.contains("Detected: <b>fight, weapon</b>"));
        assert!(text.contains("Confidence: 88%"));
        assert!(text.contains("Time: 2024-03-01 12:00:00 UTC"));
    }

    #[test]
    fn test_closed_message_has_duration() {
        let mut ev = event();
        for _ in 0..4 {
            ev.extend(0.7, &BTreeSet::new());
        }
        let end = ev.start_time + chrono::Duration::milliseconds(12_340);
        ev.close(end, CloseReason::CooldownExpired);
        let text = format_message(&EventTransition::new(TransitionKind::Closed, ev, end));
        assert!(text.contains("Duration: 12.3s"));
        assert!(text.contains("Detections: 5"));
        assert!(text.contains("Ended: 2024-03-01 12:00:12 UTC"));
    }

    #[tokio::test]
    async fn test_deliver_without_snapshot_sends_message() {
        let (base, captures) = bot_api(StatusCode::OK).await;
        let transition = EventTransition::new(TransitionKind::Opened, event(), Utc::now());

        sink(base).deliver(&transition).await.unwrap();

        let captured = captures.lock().unwrap().clone();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].path, "/bot123:abc/sendMessage");
        let body: serde_json::Value = serde_json::from_slice(&captured[0].body).unwrap();
        assert_eq!(body["chat_id"], "42");
        assert_eq!(body["parse_mode"], "HTML");
        assert!(body["text"].as_str().unwrap().starts_with("<b>Detection Alert</b>"));
    }

    #[tokio::test]
    async fn test_deliver_with_snapshot_sends_photo() {
        let (base, captures) = bot_api(StatusCode::OK).await;
        let mut transition = EventTransition::new(TransitionKind::Opened, event(), Utc::now());
        transition.snapshot = Some(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0, 0x01]));

        sink(base).deliver(&transition).await.unwrap();

        let captured = captures.lock().unwrap().clone();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].path, "/bot123:abc/sendPhoto");
        assert!(captured[0].content_type.starts_with("multipart/form-data"));
        let body = String::from_utf8_lossy(&captured[0].body);
        assert!(body.contains("name=\"photo\""));
        assert!(body.contains(&format!("filename=\"{}.jpg\"", transition.event.id)));
        assert!(body.contains("Content-Type: image/jpeg"));
        assert!(body.contains("name=\"caption\""));
        assert!(body.contains("Detection Alert"));
    }

    #[tokio::test]
    async fn test_rejected_request_is_a_delivery_failure_without_token() {
        let (base, _captures) = bot_api(StatusCode::FORBIDDEN).await;
        let transition = EventTransition::new(TransitionKind::Opened, event(), Utc::now());

        let err = sink(base).deliver(&transition).await.unwrap_err();
        match err {
            Error::NotificationDeliveryFailure { sink, message } => {
                assert_eq!(sink, "telegram:42");
                assert!(message.contains("403"));
                assert!(!message.contains("123:abc"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
