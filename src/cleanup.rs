use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::Serialize;

use crate::app::App;
use crate::fcm::PushSender;
use crate::store::{DocumentStore, Operator, Query, WriteBatch};
use crate::types::NOTIFICATIONS;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub success: bool,
    pub deleted_count: usize,
    pub message: String,
}

pub fn retention_cutoff(now: DateTime<Utc>, retention_days: i64) -> DateTime<Utc> {
    now - Duration::days(retention_days)
}

/// Groups past retention that have already been delivered. Both predicates
/// must hold.
pub fn expired_query(cutoff: DateTime<Utc>) -> Query {
    Query::new(NOTIFICATIONS)
        .filter("notificationDate", Operator::LessThan, cutoff)
        .filter("isTriggered", Operator::Equal, true)
}

/// Deletes triggered groups older than the retention window in one batch.
pub async fn cleanup_old_notifications<S, P>(
    app: &App<S, P>,
    now: DateTime<Utc>,
) -> Result<CleanupReport>
where
    S: DocumentStore,
    P: PushSender,
{
    let cutoff = retention_cutoff(now, app.settings.retention_days);
    info!("Cleaning up triggered notifications older than {cutoff}");

    let expired = app
        .store
        .run_query(&expired_query(cutoff))
        .await
        .context("Failed to query expired notifications")?;

    let mut batch = WriteBatch::new();
    for doc in &expired {
        debug!("Deleting notification group {}", doc.id);
        batch.delete(NOTIFICATIONS, &doc.id);
    }

    app.store
        .commit(batch)
        .await
        .context("Failed to delete expired notifications")?;

    let deleted_count = expired.len();
    info!("Deleted {deleted_count} old notification groups");

    Ok(CleanupReport {
        success: true,
        deleted_count,
        message: format!("Deleted {deleted_count} old notification groups"),
    })
}
