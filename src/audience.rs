use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{Result, bail};
use log::{debug, warn};

use crate::store::DocumentStore;
use crate::types::{ADMINS, TECHNICIANS, USERS, User};

/// Who receives due-maintenance reminders.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AudienceMode {
    /// Everyone listed in `Technicians` or `Admins`.
    Roles,
    /// Every user who hasn't opted out. Users without a device token are
    /// kept so they can still be emailed.
    AllUsers,
}

impl FromStr for AudienceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "roles" => Ok(AudienceMode::Roles),
            "all-users" | "all_users" | "all" => Ok(AudienceMode::AllUsers),
            other => bail!("Unknown audience mode: {other}"),
        }
    }
}

pub async fn resolve_audience<S>(store: &S, mode: AudienceMode) -> Result<Vec<User>>
where
    S: DocumentStore + ?Sized,
{
    let users = match mode {
        AudienceMode::Roles => role_members(store).await?,
        AudienceMode::AllUsers => store
            .list_documents(USERS)
            .await?
            .iter()
            .map(User::from_document)
            .filter(User::wants_notifications)
            .collect(),
    };
    debug!("Resolved {} recipients ({mode:?})", users.len());

    Ok(users)
}

async fn role_members<S>(store: &S) -> Result<Vec<User>>
where
    S: DocumentStore + ?Sized,
{
    let technicians = store.list_documents(TECHNICIANS).await?;
    let admins = store.list_documents(ADMINS).await?;

    let mut seen = HashSet::new();
    let user_ids: Vec<String> = technicians
        .into_iter()
        .chain(admins)
        .map(|doc| doc.id)
        .filter(|id| seen.insert(id.clone()))
        .collect();

    let mut users = Vec::with_capacity(user_ids.len());
    for user_id in &user_ids {
        match store.get_document(USERS, user_id).await {
            Ok(Some(doc)) => users.push(User::from_document(&doc)),
            Ok(None) => debug!("User {user_id} has no profile, skipping"),
            Err(e) => warn!("Error looking up user {user_id}: {e:#}"),
        }
    }

    Ok(users)
}

/// Push tokens of the users that should get a push, each token once.
pub fn push_tokens(users: &[User]) -> Vec<String> {
    let mut seen = HashSet::new();
    users
        .iter()
        .filter_map(User::push_token)
        .filter(|t| seen.insert(*t))
        .map(str::to_owned)
        .collect()
}
