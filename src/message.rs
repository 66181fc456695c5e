use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::{Value as Json, json};

use crate::types::{Notification, NotificationGroup};

pub const REMINDER_TITLE: &str = "🔧 Maintenance Reminder";
pub const TEST_TITLE: &str = "🔧 Test Maintenance Reminder";
pub const TEST_BODY: &str = "This is a test notification for maintenance tasks.";

pub const MAINTENANCE_REMINDER: &str = "maintenance_reminder";
pub const TEST_NOTIFICATION: &str = "test_notification";
pub const MAINTENANCE_TASK: &str = "maintenance_task";

const CHANNEL_ID: &str = "maintenance_channel";
const ANDROID_ICON: &str = "ic_launcher";
const WEB_ICON: &str = "/icon.png";
const CLICK_ACTION: &str = "FLUTTER_NOTIFICATION_CLICK";
const WEB_LINK: &str = "/maintenance-tasks";
const WEB_TTL_SECONDS: &str = "86400";

/// An FCM HTTP v1 message.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<PushNotification>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub android: Option<AndroidConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apns: Option<ApnsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webpush: Option<WebpushConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AndroidConfig {
    pub priority: String,
    pub notification: AndroidNotification,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AndroidNotification {
    pub channel_id: String,
    pub icon: String,
    pub default_sound: bool,
    pub default_vibrate_timings: bool,
    pub notification_priority: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_action: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApnsConfig {
    pub headers: BTreeMap<String, String>,
    pub payload: Json,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WebpushConfig {
    pub headers: BTreeMap<String, String>,
    pub notification: Json,
    pub fcm_options: WebpushFcmOptions,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WebpushFcmOptions {
    pub link: String,
}

impl Message {
    /// Builds a message with the common platform blocks for every channel.
    pub fn new(title: &str, body: &str, data: BTreeMap<String, String>) -> Self {
        Self {
            token: None,
            notification: Some(PushNotification {
                title: title.to_owned(),
                body: body.to_owned(),
            }),
            data,
            android: Some(android_config()),
            apns: Some(apns_config()),
            webpush: Some(webpush_config()),
        }
    }

    pub fn to_token(&self, token: &str) -> Self {
        Self {
            token: Some(token.to_owned()),
            ..self.clone()
        }
    }
}

fn android_config() -> AndroidConfig {
    AndroidConfig {
        priority: "high".to_owned(),
        notification: AndroidNotification {
            channel_id: CHANNEL_ID.to_owned(),
            icon: ANDROID_ICON.to_owned(),
            default_sound: true,
            default_vibrate_timings: true,
            notification_priority: "PRIORITY_HIGH".to_owned(),
            click_action: Some(CLICK_ACTION.to_owned()),
        },
    }
}

fn apns_config() -> ApnsConfig {
    ApnsConfig {
        headers: BTreeMap::from([("apns-priority".to_owned(), "10".to_owned())]),
        payload: json!({ "aps": { "sound": "default", "badge": 1 } }),
    }
}

fn webpush_config() -> WebpushConfig {
    WebpushConfig {
        headers: BTreeMap::from([
            ("TTL".to_owned(), WEB_TTL_SECONDS.to_owned()),
            ("Urgency".to_owned(), "high".to_owned()),
        ]),
        notification: json!({
            "icon": WEB_ICON,
            "badge": WEB_ICON,
            "requireInteraction": true,
            "vibrate": [200, 100, 200],
        }),
        fcm_options: WebpushFcmOptions {
            link: WEB_LINK.to_owned(),
        },
    }
}

/// Distinct categories in first-seen order. Blank categories are dropped.
pub fn categories(notifications: &[Notification]) -> Vec<String> {
    let mut seen = Vec::new();
    for category in notifications
        .iter()
        .filter_map(|n| n.category.as_deref())
        .map(str::trim)
        .filter(|c| !c.is_empty())
    {
        if !seen.iter().any(|s: &String| s == category) {
            seen.push(category.to_owned());
        }
    }
    seen
}

pub fn reminder_body(categories: &[String]) -> String {
    format!(
        "Upcoming maintenance tasks for the following categories: {}",
        categories.join(", ")
    )
}

/// The reminder for a due group, without a recipient token. `dueDate` is the
/// group's calendar day in `tz`.
pub fn maintenance_reminder(group: &NotificationGroup, tz: Tz) -> Message {
    let categories = categories(&group.notifications);
    let data = BTreeMap::from([
        ("notificationId".to_owned(), group.id.clone()),
        ("type".to_owned(), MAINTENANCE_REMINDER.to_owned()),
        ("taskCount".to_owned(), group.notifications.len().to_string()),
        ("categories".to_owned(), categories.join(",")),
        (
            "dueDate".to_owned(),
            group
                .notification_date
                .with_timezone(&tz)
                .format("%Y-%m-%d")
                .to_string(),
        ),
        ("clickAction".to_owned(), CLICK_ACTION.to_owned()),
    ]);

    Message::new(REMINDER_TITLE, &reminder_body(&categories), data)
}

pub fn test_message(token: &str, now: DateTime<Utc>) -> Message {
    let data = BTreeMap::from([
        ("type".to_owned(), TEST_NOTIFICATION.to_owned()),
        (
            "timestamp".to_owned(),
            now.to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
    ]);
    Message::new(TEST_TITLE, TEST_BODY, data).to_token(token)
}

/// A one-off push about a specific task, deep-linking to `screen`.
pub fn task_message(
    token: &str,
    title: &str,
    body: &str,
    task_id: Option<&str>,
    facility_id: Option<&str>,
    screen: Option<&str>,
) -> Message {
    let mut data = BTreeMap::from([
        ("type".to_owned(), MAINTENANCE_TASK.to_owned()),
        ("clickAction".to_owned(), CLICK_ACTION.to_owned()),
    ]);
    let optional = [
        ("taskId", task_id),
        ("facilityId", facility_id),
        ("screen", screen),
    ];
    for (key, value) in optional {
        if let Some(v) = value {
            data.insert(key.to_owned(), v.to_owned());
        }
    }
    Message::new(title, body, data).to_token(token)
}
