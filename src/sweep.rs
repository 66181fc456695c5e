use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::app::App;
use crate::audience::{push_tokens, resolve_audience};
use crate::fcm::{PushSender, send_each};
use crate::message::{REMINDER_TITLE, categories, maintenance_reminder, reminder_body};
use crate::store::{
    Document, DocumentStore, Fields, Operator, Precondition, Query, Value, WriteBatch,
    is_precondition_failure,
};
use crate::types::{EMAIL_NOTIFICATIONS, NOTIFICATIONS, NotificationGroup, User};

pub const SCHEDULER: &str = "scheduler";

const TRIGGERED_AT: &str = "triggeredAt";

/// What started a sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Trigger {
    Scheduled,
    Manual { uid: String },
}

impl Trigger {
    pub fn is_manual(&self) -> bool {
        matches!(self, Trigger::Manual { .. })
    }

    pub fn triggered_by(&self) -> &str {
        match self {
            Trigger::Scheduled => SCHEDULER,
            Trigger::Manual { uid } => uid,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub success: bool,
    pub processed_count: usize,
    /// Groups another run claimed first, or that could not be read.
    pub skipped_count: usize,
    pub sent_count: usize,
    pub failed_count: usize,
    pub message: String,
}

/// Midnight of `now`'s calendar day in `tz`, as a UTC instant.
pub fn start_of_day(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local_date = now.with_timezone(&tz).date_naive();
    let midnight = local_date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        // Midnight skipped by a DST jump; the day starts at the first valid instant
        .unwrap_or_else(|| {
            (1..=3)
                .filter_map(|h| {
                    tz.from_local_datetime(&(midnight + chrono::Duration::hours(h)))
                        .earliest()
                })
                .map(|dt| dt.with_timezone(&Utc))
                .next()
                .unwrap_or(now)
        })
}

pub fn due_query(today: DateTime<Utc>) -> Query {
    Query::new(NOTIFICATIONS)
        .filter("notificationDate", Operator::LessThanOrEqual, today)
        .filter("isTriggered", Operator::Equal, false)
}

/// Sends reminders for every due, untriggered group and marks them triggered.
///
/// Per-recipient failures are logged and counted. A failure to query, to
/// resolve recipients, to claim or to commit aborts the run; messages already
/// sent by then are not recalled.
pub async fn sweep_due_notifications<S, P>(
    app: &App<S, P>,
    now: DateTime<Utc>,
    trigger: &Trigger,
) -> Result<SweepReport>
where
    S: DocumentStore,
    P: PushSender,
{
    let settings = &app.settings;
    let today = start_of_day(now, settings.time_zone);
    info!("Running notification check at {now} (due on or before {today}, {trigger:?})");

    let due = app
        .store
        .run_query(&due_query(today))
        .await
        .context("Failed to query due notifications")?;
    info!("Found {} notification groups to process", due.len());

    let mut report = SweepReport::default();
    let mut batch = WriteBatch::new();

    if !due.is_empty() {
        let audience = match resolve_audience(&app.store, settings.audience).await {
            Ok(audience) => audience,
            Err(e) => {
                error!("Error resolving notification recipients: {e:#}");
                return Err(e.context("Failed to resolve notification recipients"));
            }
        };
        let tokens = push_tokens(&audience);
        info!(
            "Sending notifications to {} devices of {} users",
            tokens.len(),
            audience.len()
        );

        let triggered_hour = now.with_timezone(&settings.time_zone).hour() as i64;

        for doc in &due {
            let group = match NotificationGroup::from_document(doc) {
                Ok(group) => group,
                Err(e) => {
                    warn!("Skipping unreadable group {}: {e:#}", doc.id);
                    report.skipped_count += 1;
                    continue;
                }
            };

            let update = triggered_update(&group, triggered_hour, trigger);
            if settings.claim_groups {
                match claim(&app.store, doc, update).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("Group {} was claimed by another run, skipping", group.id);
                        report.skipped_count += 1;
                        continue;
                    }
                    Err(e) => {
                        error!("Error claiming group {}: {e:#}", group.id);
                        return Err(e);
                    }
                }
            } else {
                batch.push_update(
                    NOTIFICATIONS,
                    &group.id,
                    update,
                    vec![TRIGGERED_AT.to_owned()],
                    None,
                );
            }

            debug!(
                "Processing notification group {} with {} tasks",
                group.id,
                group.notifications.len()
            );

            let message = maintenance_reminder(&group, settings.time_zone);
            let delivery = send_each(&app.push, &message, &tokens).await;
            report.sent_count += delivery.success_count;
            report.failed_count += delivery.failure_count;

            if settings.email_enabled {
                queue_emails(&mut batch, &group, &audience);
            }

            report.processed_count += 1;
        }
    }

    if let Err(e) = app.store.commit(batch).await {
        error!("Error committing notification updates: {e:#}");
        return Err(e.context("Failed to commit notification updates"));
    }

    report.success = true;
    report.message = match trigger {
        Trigger::Scheduled => format!("Processed {} notification groups", report.processed_count),
        Trigger::Manual { .. } => format!(
            "Manually triggered {} notifications",
            report.processed_count
        ),
    };
    info!(
        "{} ({} pushes sent, {} failed, {} skipped)",
        report.message, report.sent_count, report.failed_count, report.skipped_count
    );

    Ok(report)
}

/// Everything written to a group once it has been processed, apart from the
/// `triggeredAt` server timestamp.
fn triggered_update(group: &NotificationGroup, triggered_hour: i64, trigger: &Trigger) -> Fields {
    let mut fields = Fields::new();
    fields.insert("isTriggered".to_owned(), true.into());
    fields.insert("notifications".to_owned(), group.triggered_notifications());
    fields.insert("triggeredHour".to_owned(), triggered_hour.into());
    fields.insert("triggeredManually".to_owned(), trigger.is_manual().into());
    fields.insert("triggeredBy".to_owned(), trigger.triggered_by().into());
    fields
}

/// Writes the triggered `update` only if the group is unchanged since it was
/// read. Returns false when another invocation got there first.
async fn claim<S>(store: &S, doc: &Document, update: Fields) -> Result<bool>
where
    S: DocumentStore + ?Sized,
{
    let precondition = match doc.update_time {
        Some(ts) => Precondition::UpdateTime(ts),
        None => Precondition::Exists(true),
    };

    let mut batch = WriteBatch::new();
    batch.push_update(
        NOTIFICATIONS,
        &doc.id,
        update,
        vec![TRIGGERED_AT.to_owned()],
        Some(precondition),
    );

    match store.commit(batch).await {
        Ok(()) => Ok(true),
        Err(e) if is_precondition_failure(&e) => Ok(false),
        Err(e) => Err(e.context(format!("Failed to claim group {}", doc.id))),
    }
}

fn queue_emails(batch: &mut WriteBatch, group: &NotificationGroup, audience: &[User]) {
    let categories = categories(&group.notifications);
    let text = reminder_body(&categories);
    let html = format!(
        "<p>{}</p><ul>{}</ul>",
        escape_html(&text),
        group
            .notifications
            .iter()
            .map(|n| format!(
                "<li>{} - {}: {}</li>",
                escape_html(n.category.as_deref().unwrap_or("General")),
                escape_html(n.component.as_deref().unwrap_or("")),
                escape_html(n.intervention.as_deref().unwrap_or("")),
            ))
            .collect::<String>()
    );

    for user in audience {
        let Some(email) = user.email_address() else {
            continue;
        };

        let mut message = Fields::new();
        message.insert("subject".to_owned(), REMINDER_TITLE.into());
        message.insert("text".to_owned(), text.clone().into());
        message.insert("html".to_owned(), html.clone().into());

        let mut fields = Fields::new();
        fields.insert("to".to_owned(), email.into());
        fields.insert("message".to_owned(), Value::Map(message));
        fields.insert("notificationId".to_owned(), group.id.clone().into());
        fields.insert("userId".to_owned(), user.id.clone().into());

        // One record per group and user
        let id = format!("{}-{}", group.id, user.id);
        batch.push_update(
            EMAIL_NOTIFICATIONS,
            &id,
            fields,
            vec!["createdAt".to_owned()],
            None,
        );
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
