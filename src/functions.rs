use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};

use crate::app::App;
use crate::callable::{
    CallableError, MaintenanceNotificationRequest, send_maintenance_notification,
    send_test_notification, trigger_notifications_manually,
};
use crate::cleanup::cleanup_old_notifications;
use crate::config::Settings;
use crate::fcm::PushSender;
use crate::store::DocumentStore;
use crate::sweep::{Trigger, sweep_due_notifications};
use crate::types::AuthContext;

#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Job {
    CheckNotifications,
    CleanupOldNotifications,
}

#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallableName {
    TriggerNotificationsManually,
    SendTestNotification,
    SendMaintenanceNotification,
}

/// One invocation of a function, as delivered by the runtime.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Invocation {
    Scheduled {
        job: Job,
    },
    Callable {
        name: CallableName,
        #[serde(default)]
        auth: Option<AuthContext>,
        #[serde(default)]
        data: Json,
    },
}

/// A cron registration for deployment tooling.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub job: Job,
    pub cron: &'static str,
    pub time_zone: String,
}

pub const CHECK_NOTIFICATIONS_CRON: &str = "0 9,11 * * *";
pub const CLEANUP_CRON: &str = "0 0 * * 0";

pub fn schedules(settings: &Settings) -> Vec<Schedule> {
    let time_zone = settings.time_zone.name().to_owned();
    vec![
        Schedule {
            job: Job::CheckNotifications,
            cron: CHECK_NOTIFICATIONS_CRON,
            time_zone: time_zone.clone(),
        },
        Schedule {
            job: Job::CleanupOldNotifications,
            cron: CLEANUP_CRON,
            time_zone,
        },
    ]
}

pub async fn run_job<S, P>(app: &App<S, P>, job: Job, now: DateTime<Utc>) -> Result<Json>
where
    S: DocumentStore,
    P: PushSender,
{
    info!("Running {job:?}");
    let result = match job {
        Job::CheckNotifications => {
            let report = sweep_due_notifications(app, now, &Trigger::Scheduled)
                .await
                .context("Failed to process notifications")?;
            serde_json::to_value(report)?
        }
        Job::CleanupOldNotifications => {
            let report = cleanup_old_notifications(app, now)
                .await
                .context("Failed to clean up old notifications")?;
            serde_json::to_value(report)?
        }
    };
    Ok(result)
}

async fn call<S, P>(
    app: &App<S, P>,
    name: CallableName,
    auth: Option<&AuthContext>,
    data: Json,
    now: DateTime<Utc>,
) -> Result<Json, CallableError>
where
    S: DocumentStore,
    P: PushSender,
{
    let to_json = |v: Result<Json, serde_json::Error>| {
        v.map_err(|e| CallableError::Internal(format!("Unserializable result: {e}")))
    };

    match name {
        CallableName::TriggerNotificationsManually => {
            let report = trigger_notifications_manually(app, auth, now).await?;
            to_json(serde_json::to_value(report))
        }
        CallableName::SendTestNotification => {
            let result = send_test_notification(app, auth, now).await?;
            to_json(serde_json::to_value(result))
        }
        CallableName::SendMaintenanceNotification => {
            let request: MaintenanceNotificationRequest = if data.is_null() {
                MaintenanceNotificationRequest::default()
            } else {
                serde_json::from_value(data)
                    .map_err(|e| CallableError::InvalidArgument(format!("Invalid request: {e}")))?
            };
            let result = send_maintenance_notification(app, &request).await?;
            to_json(serde_json::to_value(result))
        }
    }
}

/// Routes an invocation to its handler.
///
/// Scheduled jobs fail the invocation on error. Callables always answer,
/// either with their result or with `{"error": {"code", "message"}}`.
pub async fn dispatch<S, P>(
    app: &App<S, P>,
    invocation: Invocation,
    now: DateTime<Utc>,
) -> Result<Json>
where
    S: DocumentStore,
    P: PushSender,
{
    debug!("{invocation:?}");
    match invocation {
        Invocation::Scheduled { job } => run_job(app, job, now).await,
        Invocation::Callable { name, auth, data } => {
            match call(app, name, auth.as_ref(), data, now).await {
                Ok(result) => Ok(json!({ "result": result })),
                Err(e) => {
                    info!("{name:?} rejected: {} {e}", e.code());
                    Ok(e.to_json())
                }
            }
        }
    }
}
