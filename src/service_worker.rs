//! Behavior of the web app's push service worker.
//!
//! The browser glue hands payloads, clicks and open windows to these
//! functions and performs whatever they return; nothing here touches a
//! browser API directly.

use std::collections::BTreeMap;

use anyhow::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::message::MAINTENANCE_REMINDER;

pub const DEFAULT_TITLE: &str = "NyumbaSmart Maintenance";
pub const DEFAULT_BODY: &str = "You have maintenance tasks to check";
pub const NOTIFICATION_TAG: &str = "maintenance-notification";
pub const ICON: &str = "/icon.png";
pub const BADGE_COUNT_KEY: &str = "notification_count";
pub const VIEW_ROUTE: &str = "/maintenance-tasks";
pub const HOME_ROUTE: &str = "/";

pub const VIEW_ACTION: &str = "view";
pub const DISMISS_ACTION: &str = "dismiss";

/// An incoming push as the messaging SDK delivers it to the worker.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct PushPayload {
    pub notification: Option<PayloadNotification>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct PayloadNotification {
    pub title: Option<String>,
    pub body: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub notification_id: String,
    pub url: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Arguments for `registration.showNotification(title, options)`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayNotification {
    #[serde(skip)]
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub require_interaction: bool,
    pub actions: Vec<NotificationAction>,
    pub data: NotificationData,
    pub vibrate: Vec<u32>,
    pub silent: bool,
    pub renotify: bool,
}

/// Client-side key/value storage backing the badge counter.
pub trait BadgeStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&mut self, key: &str, value: &str) -> Result<()>;
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Turns a background push into a system notification. Data-only pushes
/// show nothing.
pub fn render_background_message(payload: &PushPayload, now_millis: i64) -> Option<DisplayNotification> {
    let notification = payload.notification.as_ref()?;
    let data = |key: &str| non_blank(payload.data.get(key).map(String::as_str));

    let action = |action: &str, title: &str| NotificationAction {
        action: action.to_owned(),
        title: title.to_owned(),
        icon: ICON.to_owned(),
    };

    Some(DisplayNotification {
        title: non_blank(notification.title.as_deref())
            .unwrap_or(DEFAULT_TITLE)
            .to_owned(),
        body: non_blank(notification.body.as_deref())
            .unwrap_or(DEFAULT_BODY)
            .to_owned(),
        icon: ICON.to_owned(),
        badge: ICON.to_owned(),
        tag: NOTIFICATION_TAG.to_owned(),
        require_interaction: true,
        actions: vec![
            action(VIEW_ACTION, "View Details"),
            action(DISMISS_ACTION, "Dismiss"),
        ],
        data: NotificationData {
            notification_id: data("notificationId").unwrap_or("").to_owned(),
            url: data("url").unwrap_or(HOME_ROUTE).to_owned(),
            timestamp: now_millis,
            kind: data("type").unwrap_or(MAINTENANCE_REMINDER).to_owned(),
        },
        vibrate: vec![200, 100, 200],
        silent: false,
        renotify: true,
    })
}

/// Renders the payload and bumps the badge counter when something is shown.
pub fn on_background_message<B>(
    payload: &PushPayload,
    storage: &mut B,
    now_millis: i64,
) -> Option<DisplayNotification>
where
    B: BadgeStorage + ?Sized,
{
    let display = render_background_message(payload, now_millis)?;
    if let Err(e) = increment_badge(storage) {
        warn!("Error updating notification count: {e:#}");
    }
    Some(display)
}

pub fn badge_count<B: BadgeStorage + ?Sized>(storage: &B) -> Result<u32> {
    // Unparseable counts restart from zero
    Ok(storage
        .get_item(BADGE_COUNT_KEY)?
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0))
}

pub fn increment_badge<B: BadgeStorage + ?Sized>(storage: &mut B) -> Result<u32> {
    let count = badge_count(storage)?.saturating_add(1);
    storage.set_item(BADGE_COUNT_KEY, &count.to_string())?;
    Ok(count)
}

pub fn reset_badge<B: BadgeStorage + ?Sized>(storage: &mut B) -> Result<()> {
    storage.set_item(BADGE_COUNT_KEY, "0")
}

/// An open app window, as reported by `clients.matchAll`.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientWindow {
    pub id: String,
    pub url: String,
    pub focusable: bool,
}

/// Posted to a focused window when the user picks "View Details".
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickedMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub notification_id: Option<String>,
}

impl ClickedMessage {
    pub const TYPE: &'static str = "NOTIFICATION_CLICKED";
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClickOutcome {
    Focus {
        client_id: String,
        message: Option<ClickedMessage>,
    },
    OpenWindow {
        url: String,
    },
    Close,
}

fn same_origin_client<'a>(clients: &'a [ClientWindow], origin: &str) -> Option<&'a ClientWindow> {
    clients
        .iter()
        .find(|c| c.focusable && c.url.contains(origin))
}

/// Decides what a notification click does. The notification itself is
/// always closed by the caller.
pub fn handle_click(
    action: &str,
    data: Option<&NotificationData>,
    clients: &[ClientWindow],
    origin: &str,
) -> ClickOutcome {
    match action {
        VIEW_ACTION => match same_origin_client(clients, origin) {
            Some(client) => ClickOutcome::Focus {
                client_id: client.id.clone(),
                message: Some(ClickedMessage {
                    kind: ClickedMessage::TYPE,
                    notification_id: data.map(|d| d.notification_id.clone()),
                }),
            },
            None => ClickOutcome::OpenWindow {
                url: VIEW_ROUTE.to_owned(),
            },
        },
        DISMISS_ACTION => {
            debug!("Notification dismissed");
            ClickOutcome::Close
        }
        _ => match same_origin_client(clients, origin) {
            Some(client) => ClickOutcome::Focus {
                client_id: client.id.clone(),
                message: None,
            },
            None => ClickOutcome::OpenWindow {
                url: HOME_ROUTE.to_owned(),
            },
        },
    }
}

/// Resets the badge counter and decides what the click does.
pub fn on_notification_click<B>(
    action: &str,
    data: Option<&NotificationData>,
    clients: &[ClientWindow],
    origin: &str,
    storage: &mut B,
) -> ClickOutcome
where
    B: BadgeStorage + ?Sized,
{
    if let Err(e) = reset_badge(storage) {
        warn!("Error resetting notification count: {e:#}");
    }
    handle_click(action, data, clients, origin)
}
