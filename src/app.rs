use std::sync::Arc;

use anyhow::{Context, Result};
use gcp_auth::{CustomServiceAccount, TokenProvider};
use log::info;

use crate::config::{Config, Settings};
use crate::fcm::{FcmClient, PushSender};
use crate::firestore::FirestoreClient;
use crate::store::DocumentStore;

/// Everything a function needs. Built once per process and shared by
/// reference with every invocation.
pub struct App<S, P> {
    pub store: S,
    pub push: P,
    pub settings: Settings,
}

impl<S, P> App<S, P>
where
    S: DocumentStore,
    P: PushSender,
{
    pub fn new(store: S, push: P, settings: Settings) -> Self {
        Self {
            store,
            push,
            settings,
        }
    }
}

pub type FirebaseApp = App<FirestoreClient, FcmClient>;

impl FirebaseApp {
    pub async fn from_config(config: Config) -> Result<Self> {
        let service_account = CustomServiceAccount::from_json(config.service_account_key.expose())
            .context("Invalid GOOGLE_SERVICE_ACCOUNT_KEY")?;
        let token_provider: Arc<dyn TokenProvider> = Arc::new(service_account);

        let project_id = match config.project_id {
            Some(project_id) => project_id,
            None => token_provider
                .project_id()
                .await
                .context("FIREBASE_PROJECT_ID not set and the service account has no project")?
                .to_string(),
        };
        info!("Using Firebase project {project_id}");

        Ok(Self::new(
            FirestoreClient::new(token_provider.clone(), project_id.clone()),
            FcmClient::new(token_provider, project_id),
            config.settings,
        ))
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(Config::from_env()?).await
    }
}
