use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::store::{Document, Fields, Value};

pub const NOTIFICATIONS: &str = "Notifications";
pub const USERS: &str = "Users";
pub const TECHNICIANS: &str = "Technicians";
pub const ADMINS: &str = "Admins";
pub const DEVELOPERS: &str = "Developers";
pub const EMAIL_NOTIFICATIONS: &str = "EmailNotifications";

/// A batch of maintenance tasks that come due on the same date.
#[derive(Clone, Debug, PartialEq)]
pub struct NotificationGroup {
    pub id: String,
    pub notification_date: DateTime<Utc>,
    pub is_triggered: bool,
    pub is_read: Option<bool>,
    pub notifications: Vec<Notification>,
}

impl NotificationGroup {
    pub fn from_document(doc: &Document) -> Result<Self> {
        let notification_date = doc
            .get("notificationDate")
            .and_then(Value::as_timestamp)
            .ok_or_else(|| anyhow!("Group {} has no notificationDate timestamp", doc.id))?;

        let notifications = match doc.get("notifications") {
            Some(Value::Array(values)) => values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    Notification::from_value(v)
                        .with_context(|| format!("Group {} notification {i}", doc.id))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(Value::Null) | None => vec![],
            Some(other) => {
                return Err(anyhow!(
                    "Group {} has non-array notifications: {other:?}",
                    doc.id
                ));
            }
        };

        Ok(Self {
            id: doc.id.clone(),
            notification_date,
            is_triggered: doc
                .get("isTriggered")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            is_read: doc.get("isRead").and_then(Value::as_bool),
            notifications,
        })
    }

    /// The embedded notifications with every `isTriggered` flag set.
    pub fn triggered_notifications(&self) -> Value {
        Value::Array(
            self.notifications
                .iter()
                .map(|n| n.triggered().to_value())
                .collect(),
        )
    }
}

/// One maintenance task embedded in a [`NotificationGroup`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Notification {
    pub category: Option<String>,
    pub component: Option<String>,
    pub intervention: Option<String>,
    pub frequency: Option<String>,
    pub last_inspection_date: Option<Value>,
    pub next_inspection_date: Option<Value>,
    pub is_triggered: bool,
    /// Fields written by the app that this crate doesn't interpret; kept so
    /// rewriting the array doesn't drop them.
    pub extra: Fields,
}

const CATEGORY: &str = "category";
const COMPONENT: &str = "component";
const INTERVENTION: &str = "intervention";
const FREQUENCY: &str = "frequency";
const LAST_INSPECTION_DATE: &str = "lastInspectionDate";
const NEXT_INSPECTION_DATE: &str = "nextInspectionDate";
const IS_TRIGGERED: &str = "isTriggered";

impl Notification {
    pub fn from_value(value: &Value) -> Result<Self> {
        let mut extra = value
            .as_map()
            .ok_or_else(|| anyhow!("Expected a map, got {value:?}"))?
            .clone();

        let mut take_str = |key: &str| match extra.remove(key) {
            Some(Value::String(s)) => Some(s),
            Some(Value::Null) | None => None,
            Some(other) => {
                // Keep oddly typed values around rather than losing them
                extra.insert(key.to_owned(), other);
                None
            }
        };

        let category = take_str(CATEGORY);
        let component = take_str(COMPONENT);
        let intervention = take_str(INTERVENTION);
        let frequency = take_str(FREQUENCY);

        let last_inspection_date = extra.remove(LAST_INSPECTION_DATE);
        let next_inspection_date = extra.remove(NEXT_INSPECTION_DATE);
        let is_triggered = extra
            .remove(IS_TRIGGERED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Ok(Self {
            category,
            component,
            intervention,
            frequency,
            last_inspection_date,
            next_inspection_date,
            is_triggered,
            extra,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut fields = self.extra.clone();
        let strings = [
            (CATEGORY, &self.category),
            (COMPONENT, &self.component),
            (INTERVENTION, &self.intervention),
            (FREQUENCY, &self.frequency),
        ];
        for (key, value) in strings {
            if let Some(v) = value {
                fields.insert(key.to_owned(), Value::String(v.clone()));
            }
        }
        if let Some(v) = &self.last_inspection_date {
            fields.insert(LAST_INSPECTION_DATE.to_owned(), v.clone());
        }
        if let Some(v) = &self.next_inspection_date {
            fields.insert(NEXT_INSPECTION_DATE.to_owned(), v.clone());
        }
        fields.insert(IS_TRIGGERED.to_owned(), Value::Boolean(self.is_triggered));
        Value::Map(fields)
    }

    pub fn triggered(&self) -> Self {
        Self {
            is_triggered: true,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct User {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub fcm_token: Option<String>,
    /// Absent means enabled.
    pub notifications_enabled: Option<bool>,
}

impl User {
    pub fn from_document(doc: &Document) -> Self {
        let string = |key: &str| {
            doc.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };

        Self {
            id: doc.id.clone(),
            name: string("name"),
            email: string("email"),
            fcm_token: string("fcmToken"),
            notifications_enabled: doc.get("notificationsEnabled").and_then(Value::as_bool),
        }
    }

    pub fn wants_notifications(&self) -> bool {
        self.notifications_enabled != Some(false)
    }

    /// The token to push to, if this user should get pushes at all.
    pub fn push_token(&self) -> Option<&str> {
        if self.wants_notifications() {
            self.fcm_token.as_deref()
        } else {
            None
        }
    }

    pub fn email_address(&self) -> Option<&str> {
        if self.wants_notifications() {
            self.email.as_deref()
        } else {
            None
        }
    }
}

/// Caller identity, already verified by the platform.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AuthContext {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    const EXAMPLE_GROUP_DOCUMENT: &str = include_str!("../tests/fixtures/notification_group.json");

    fn group_document() -> Document {
        let raw: serde_json::Value = serde_json::from_str(EXAMPLE_GROUP_DOCUMENT).unwrap();
        crate::firestore::document_from_json(&raw).unwrap()
    }

    #[test]
    fn test_group_from_fixture() -> Result<()> {
        let group = NotificationGroup::from_document(&group_document())?;

        assert_eq!(group.id, "grp-2024-05-01");
        assert_eq!(
            group.notification_date,
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
        assert!(!group.is_triggered);
        assert_eq!(group.is_read, Some(false));
        assert_eq!(group.notifications.len(), 3);
        assert_eq!(group.notifications[0].category.as_deref(), Some("HVAC"));
        assert_eq!(
            group.notifications[1].intervention.as_deref(),
            Some("Inspect valves")
        );

        Ok(())
    }

    #[test]
    fn test_group_missing_notifications_is_empty() -> Result<()> {
        let mut fields = Fields::new();
        fields.insert(
            "notificationDate".to_owned(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().into(),
        );
        let group = NotificationGroup::from_document(&Document::new("g", fields))?;
        assert!(group.notifications.is_empty());
        assert!(!group.is_triggered);
        Ok(())
    }

    #[test]
    fn test_group_without_date_is_rejected() {
        assert!(NotificationGroup::from_document(&Document::new("g", Fields::new())).is_err());
    }

    #[test]
    fn test_triggered_notifications_flips_every_flag() -> Result<()> {
        let group = NotificationGroup::from_document(&group_document())?;
        let Value::Array(values) = group.triggered_notifications() else {
            panic!("expected array");
        };
        assert_eq!(values.len(), 3);
        for v in &values {
            assert_eq!(v.as_map().unwrap()["isTriggered"], Value::Boolean(true));
        }
        Ok(())
    }

    #[test]
    fn test_notification_preserves_unknown_fields() -> Result<()> {
        let mut fields = Fields::new();
        fields.insert("category".to_owned(), "Plumbing".into());
        fields.insert("assetTag".to_owned(), "P-17".into());
        fields.insert("isTriggered".to_owned(), false.into());

        let notification = Notification::from_value(&Value::Map(fields))?;
        assert_eq!(notification.extra.get("assetTag"), Some(&Value::from("P-17")));

        let round = notification.triggered().to_value();
        let map = round.as_map().unwrap();
        assert_eq!(map["assetTag"], Value::from("P-17"));
        assert_eq!(map["category"], Value::from("Plumbing"));
        assert_eq!(map["isTriggered"], Value::Boolean(true));
        Ok(())
    }

    #[test]
    fn test_notification_keeps_non_string_category() -> Result<()> {
        let mut fields = Fields::new();
        fields.insert("category".to_owned(), Value::Integer(3));
        let notification = Notification::from_value(&Value::Map(fields))?;
        assert_eq!(notification.category, None);
        assert_eq!(notification.extra.get("category"), Some(&Value::Integer(3)));
        Ok(())
    }

    fn user(token: Option<&str>, enabled: Option<bool>) -> User {
        User {
            id: "u1".to_owned(),
            fcm_token: token.map(str::to_owned),
            notifications_enabled: enabled,
            ..Default::default()
        }
    }

    #[test]
    fn test_push_token_enabled_by_default() {
        assert_eq!(user(Some("tok"), None).push_token(), Some("tok"));
    }

    #[test]
    fn test_push_token_explicitly_enabled() {
        assert_eq!(user(Some("tok"), Some(true)).push_token(), Some("tok"));
    }

    #[test]
    fn test_push_token_disabled() {
        assert_eq!(user(Some("tok"), Some(false)).push_token(), None);
    }

    #[test]
    fn test_push_token_missing() {
        assert_eq!(user(None, None).push_token(), None);
    }

    #[test]
    fn test_user_from_document_blank_token_is_none() {
        let mut fields = Fields::new();
        fields.insert("fcmToken".to_owned(), "   ".into());
        fields.insert("email".to_owned(), "tech@example.com".into());
        fields.insert("notificationsEnabled".to_owned(), Value::Null);
        let user = User::from_document(&Document::new("u9", fields));
        assert_eq!(user.fcm_token, None);
        assert_eq!(user.email.as_deref(), Some("tech@example.com"));
        assert!(user.wants_notifications());
    }

    #[test]
    fn test_auth_context_deserialize() {
        let auth: AuthContext = serde_json::from_str(r#"{"uid":"abc"}"#).unwrap();
        assert_eq!(auth.uid, "abc");
        assert_eq!(auth.email, None);
    }
}
