use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};

use crate::app::App;
use crate::fcm::{PushSender, redact_token};
use crate::message::{task_message, test_message};
use crate::store::DocumentStore;
use crate::sweep::{SweepReport, Trigger, sweep_due_notifications};
use crate::types::{AuthContext, DEVELOPERS, USERS, User};

/// Errors a callable reports back to its caller, with the platform's codes.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CallableError {
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    FailedPrecondition(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Internal(String),
}

impl CallableError {
    pub fn code(&self) -> &'static str {
        match self {
            CallableError::Unauthenticated(_) => "unauthenticated",
            CallableError::PermissionDenied(_) => "permission-denied",
            CallableError::NotFound(_) => "not-found",
            CallableError::FailedPrecondition(_) => "failed-precondition",
            CallableError::InvalidArgument(_) => "invalid-argument",
            CallableError::Internal(_) => "internal",
        }
    }

    pub fn to_json(&self) -> Json {
        json!({ "error": { "code": self.code(), "message": self.to_string() } })
    }
}

pub type CallableResult<T> = Result<T, CallableError>;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

fn require_auth(auth: Option<&AuthContext>) -> CallableResult<&AuthContext> {
    auth.ok_or_else(|| CallableError::Unauthenticated("User must be authenticated".to_owned()))
}

fn internal(context: &str, e: anyhow::Error) -> CallableError {
    error!("{context}: {e:#}");
    CallableError::Internal(context.to_owned())
}

/// Runs the due-notification sweep on behalf of an operator.
pub async fn trigger_notifications_manually<S, P>(
    app: &App<S, P>,
    auth: Option<&AuthContext>,
    now: DateTime<Utc>,
) -> CallableResult<SweepReport>
where
    S: DocumentStore,
    P: PushSender,
{
    let auth = require_auth(auth)?;

    if app.settings.require_developer {
        let developer = app
            .store
            .get_document(DEVELOPERS, &auth.uid)
            .await
            .map_err(|e| internal("Failed to trigger notifications manually", e))?;
        if developer.is_none() {
            warn!("User {} tried to trigger notifications without developer access", auth.uid);
            return Err(CallableError::PermissionDenied(
                "Only developers can manually trigger notifications".to_owned(),
            ));
        }
    }

    info!("Manual notification trigger by {}", auth.uid);
    let trigger = Trigger::Manual {
        uid: auth.uid.clone(),
    };
    sweep_due_notifications(app, now, &trigger)
        .await
        .map_err(|e| internal("Failed to trigger notifications manually", e))
}

/// Pushes a fixed test message to the caller's own device.
pub async fn send_test_notification<S, P>(
    app: &App<S, P>,
    auth: Option<&AuthContext>,
    now: DateTime<Utc>,
) -> CallableResult<SendResult>
where
    S: DocumentStore,
    P: PushSender,
{
    let auth = require_auth(auth)?;

    let doc = app
        .store
        .get_document(USERS, &auth.uid)
        .await
        .map_err(|e| internal("Failed to send test notification", e))?
        .ok_or_else(|| CallableError::NotFound("User not found".to_owned()))?;
    let user = User::from_document(&doc);

    let token = user.fcm_token.as_deref().ok_or_else(|| {
        CallableError::FailedPrecondition("No FCM token found for user".to_owned())
    })?;

    let message_id = app
        .push
        .send(&test_message(token, now))
        .await
        .map_err(|e| internal("Failed to send test notification", e))?;
    info!("Test notification sent to {} ({})", auth.uid, redact_token(token));

    Ok(SendResult {
        success: true,
        message: "Test notification sent successfully".to_owned(),
        message_id: Some(message_id),
    })
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceNotificationRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub task_id: Option<String>,
    pub facility_id: Option<String>,
    pub screen: Option<String>,
}

/// Pushes a caller-composed message about one task to one device. Needs no
/// authentication.
pub async fn send_maintenance_notification<S, P>(
    app: &App<S, P>,
    request: &MaintenanceNotificationRequest,
) -> CallableResult<SendResult>
where
    S: DocumentStore,
    P: PushSender,
{
    for (name, value) in [
        ("token", &request.token),
        ("title", &request.title),
        ("body", &request.body),
    ] {
        if value.trim().is_empty() {
            return Err(CallableError::InvalidArgument(format!("Missing {name}")));
        }
    }

    let message = task_message(
        &request.token,
        &request.title,
        &request.body,
        request.task_id.as_deref(),
        request.facility_id.as_deref(),
        request.screen.as_deref(),
    );

    let message_id = app
        .push
        .send(&message)
        .await
        .map_err(|e| internal("Failed to send maintenance notification", e))?;
    info!(
        "Maintenance notification sent to {} for task {:?}",
        redact_token(&request.token),
        request.task_id
    );

    Ok(SendResult {
        success: true,
        message: "Notification sent successfully".to_owned(),
        message_id: Some(message_id),
    })
}
