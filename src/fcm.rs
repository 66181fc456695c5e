use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use gcp_auth::TokenProvider;
use log::{debug, trace, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::message::Message;

const FCM_API: &str = "https://fcm.googleapis.com/v1/projects";
const SCOPES: &[&str] = &["https://www.googleapis.com/auth/firebase.messaging"];

#[async_trait]
pub trait PushSender: Send + Sync {
    /// Sends one message and returns the id the push service assigned to it.
    async fn send(&self, message: &Message) -> Result<String>;
}

pub struct FcmClient {
    token_provider: Arc<dyn TokenProvider>,
    project_id: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    name: String,
}

impl FcmClient {
    pub fn new(token_provider: Arc<dyn TokenProvider>, project_id: impl Into<String>) -> Self {
        Self {
            token_provider,
            project_id: project_id.into(),
            client: Client::new(),
        }
    }

    fn send_url(&self) -> String {
        format!("{}/{}/messages:send", FCM_API, self.project_id)
    }
}

#[async_trait]
impl PushSender for FcmClient {
    async fn send(&self, message: &Message) -> Result<String> {
        let token = self.token_provider.token(SCOPES).await?;
        let body = json!({ "message": message });
        trace!("{body}");

        let response: SendResponse = self
            .client
            .post(self.send_url())
            .bearer_auth(token.as_str())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Unreadable FCM send response")?;

        Ok(response.name)
    }
}

#[derive(Debug)]
pub struct Delivery {
    pub token: String,
    pub result: Result<String, String>,
}

/// Outcome of fanning one message out to many tokens.
#[derive(Debug, Default)]
pub struct BatchResponse {
    pub success_count: usize,
    pub failure_count: usize,
    pub deliveries: Vec<Delivery>,
}

/// Sends `template` to every token in turn. A failed token is logged and
/// recorded; it never stops delivery to the rest.
pub async fn send_each<P>(sender: &P, template: &Message, tokens: &[String]) -> BatchResponse
where
    P: PushSender + ?Sized,
{
    let mut response = BatchResponse::default();

    for token in tokens {
        match sender.send(&template.to_token(token)).await {
            Ok(id) => {
                debug!("Push sent to {}: {id}", redact_token(token));
                response.success_count += 1;
                response.deliveries.push(Delivery {
                    token: token.clone(),
                    result: Ok(id),
                });
            }
            Err(e) => {
                warn!("Error sending push to {}: {e:#}", redact_token(token));
                response.failure_count += 1;
                response.deliveries.push(Delivery {
                    token: token.clone(),
                    result: Err(format!("{e:#}")),
                });
            }
        }
    }

    response
}

/// Short prefix of a device token for logs.
pub fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}…")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::RecordingPush;
    use std::collections::BTreeMap;

    fn template() -> Message {
        Message::new("title", "body", BTreeMap::new())
    }

    fn tokens(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_send_each_all_succeed() {
        let push = RecordingPush::default();
        let response = send_each(&push, &template(), &tokens(&["a", "b", "c"])).await;

        assert_eq!(response.success_count, 3);
        assert_eq!(response.failure_count, 0);
        assert_eq!(push.sent_tokens(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_send_each_one_failure_does_not_stop_others() {
        let push = RecordingPush::failing(&["b"]);
        let response = send_each(&push, &template(), &tokens(&["a", "b", "c"])).await;

        assert_eq!(response.success_count, 2);
        assert_eq!(response.failure_count, 1);
        assert_eq!(push.sent_tokens(), vec!["a", "c"]);
        assert!(response.deliveries[1].result.is_err());
        assert_eq!(response.deliveries[1].token, "b");
    }

    #[tokio::test]
    async fn test_send_each_no_tokens() {
        let push = RecordingPush::default();
        let response = send_each(&push, &template(), &[]).await;
        assert_eq!(response.success_count, 0);
        assert!(response.deliveries.is_empty());
    }

    #[test]
    fn test_redact_token() {
        assert_eq!(redact_token("abcdefghijklmnop"), "abcdefgh…");
        assert_eq!(redact_token("abc"), "abc…");
    }

    #[test]
    fn test_deserialize_send_response() {
        let response: SendResponse =
            serde_json::from_str(r#"{"name":"projects/cmms/messages/0:1500415314455276%31bd1c9631bd1c96"}"#)
                .unwrap();
        assert!(response.name.starts_with("projects/cmms/messages/"));
    }
}
