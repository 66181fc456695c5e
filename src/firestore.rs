use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use gcp_auth::TokenProvider;
use log::{debug, trace};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value as Json, json};

use crate::store::{
    Document, DocumentStore, Fields, MAX_BATCH_WRITES, PreconditionFailed, Precondition, Query,
    Write, WriteBatch, fields_from_json, fields_to_json, format_timestamp, parse_timestamp,
};

const FIRESTORE_API: &str = "https://firestore.googleapis.com/v1";
const SCOPES: &[&str] = &["https://www.googleapis.com/auth/datastore"];
const PAGE_SIZE: &str = "300";

pub struct FirestoreClient {
    token_provider: Arc<dyn TokenProvider>,
    project_id: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct DocumentList {
    #[serde(default)]
    documents: Vec<Json>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponseItem {
    document: Option<Json>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorStatus,
}

#[derive(Debug, Deserialize)]
struct ErrorStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl FirestoreClient {
    pub fn new(token_provider: Arc<dyn TokenProvider>, project_id: impl Into<String>) -> Self {
        Self {
            token_provider,
            project_id: project_id.into(),
            client: Client::new(),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let token = self.token_provider.token(SCOPES).await?;
        Ok(token.as_str().to_owned())
    }

    fn documents_url(&self) -> String {
        format!("{}/{}", FIRESTORE_API, database_path(&self.project_id))
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.documents_url(), collection)
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}", self.documents_url(), collection, id)
    }

    async fn commit_chunk(&self, token: &str, writes: &[Write]) -> Result<()> {
        let body = json!({
            "writes": writes
                .iter()
                .map(|w| write_to_json(&self.project_id, w))
                .collect::<Vec<_>>(),
        });
        trace!("{body}");

        let response = self
            .client
            .post(format!("{}:commit", self.documents_url()))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(err) if err.error.status == "FAILED_PRECONDITION" => {
                Err(PreconditionFailed(err.error.message).into())
            }
            Ok(err) => Err(anyhow!(
                "Commit failed with {status} {}: {}",
                err.error.status,
                err.error.message
            )),
            Err(_) => Err(anyhow!("Commit failed with {status}: {text}")),
        }
    }
}

#[async_trait]
impl DocumentStore for FirestoreClient {
    async fn run_query(&self, query: &Query) -> Result<Vec<Document>> {
        let token = self.access_token().await?;
        let body = json!({ "structuredQuery": query.to_structured_query() });
        trace!("{body}");

        let items: Vec<QueryResponseItem> = self
            .client
            .post(format!("{}:runQuery", self.documents_url()))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("Failed to query {}", query.collection))?;

        let documents = items
            .iter()
            .filter_map(|item| item.document.as_ref())
            .map(document_from_json)
            .collect::<Result<Vec<_>>>()?;
        debug!("Query on {} matched {} documents", query.collection, documents.len());

        Ok(documents)
    }

    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.document_url(collection, id))
            .bearer_auth(&token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let raw: Json = response.error_for_status()?.json().await?;
        Ok(Some(document_from_json(&raw)?))
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<Document>> {
        let token = self.access_token().await?;
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .get(self.collection_url(collection))
                .bearer_auth(&token)
                .query(&[("pageSize", PAGE_SIZE)]);

            if let Some(pt) = &page_token {
                req = req.query(&[("pageToken", pt.as_str())]);
            }

            let response: DocumentList = req.send().await?.error_for_status()?.json().await?;
            debug!("Fetched {} {} documents", response.documents.len(), collection);
            for raw in &response.documents {
                documents.push(document_from_json(raw)?);
            }

            match response.next_page_token {
                Some(pt) if !pt.is_empty() => page_token = Some(pt),
                _ => break,
            }
        }

        Ok(documents)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let token = self.access_token().await?;
        let writes = batch.into_writes();
        // Each chunk is atomic on its own; larger batches are not.
        for chunk in writes.chunks(MAX_BATCH_WRITES) {
            debug!("Committing {} writes", chunk.len());
            self.commit_chunk(&token, chunk).await?;
        }

        Ok(())
    }
}

fn database_path(project_id: &str) -> String {
    format!("projects/{project_id}/databases/(default)/documents")
}

fn document_name(project_id: &str, collection: &str, id: &str) -> String {
    format!("{}/{}/{}", database_path(project_id), collection, id)
}

fn write_to_json(project_id: &str, write: &Write) -> Json {
    match write {
        Write::Update {
            collection,
            id,
            fields,
            server_timestamps,
            precondition,
        } => {
            let mut body = json!({
                "update": {
                    "name": document_name(project_id, collection, id),
                    "fields": fields_to_json(fields),
                },
                "updateMask": { "fieldPaths": fields.keys().collect::<Vec<_>>() },
            });
            if !server_timestamps.is_empty() {
                body["updateTransforms"] = server_timestamps
                    .iter()
                    .map(|f| json!({ "fieldPath": f, "setToServerValue": "REQUEST_TIME" }))
                    .collect();
            }
            if let Some(precondition) = precondition {
                body["currentDocument"] = match precondition {
                    Precondition::Exists(exists) => json!({ "exists": exists }),
                    Precondition::UpdateTime(ts) => json!({ "updateTime": format_timestamp(ts) }),
                };
            }
            body
        }
        Write::Delete { collection, id } => {
            json!({ "delete": document_name(project_id, collection, id) })
        }
    }
}

/// Decodes a REST document resource. The id is the last segment of `name`.
pub fn document_from_json(raw: &Json) -> Result<Document> {
    let name = raw
        .get("name")
        .and_then(Json::as_str)
        .ok_or_else(|| anyhow!("Document without a name: {raw}"))?;
    let id = name.rsplit('/').next().unwrap_or(name).to_owned();

    let fields = match raw.get("fields") {
        Some(fields) => fields_from_json(fields).with_context(|| format!("Document {name}"))?,
        None => Fields::new(),
    };

    let update_time = raw
        .get("updateTime")
        .and_then(Json::as_str)
        .map(parse_timestamp)
        .transpose()?;

    Ok(Document {
        id,
        fields,
        update_time,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{Operator, Value};
    use chrono::{TimeZone, Utc};

    const EXAMPLE_QUERY_RESPONSE: &str = include_str!("../tests/fixtures/run_query_response.json");
    const EXAMPLE_USERS_PAGE: &str = include_str!("../tests/fixtures/users_page.json");

    const PROJECT: &str = "cmms-test";

    #[test]
    fn test_deserialize_query_response() -> Result<()> {
        let items: Vec<QueryResponseItem> = serde_json::from_str(EXAMPLE_QUERY_RESPONSE)?;
        let documents = items
            .iter()
            .filter_map(|item| item.document.as_ref())
            .map(document_from_json)
            .collect::<Result<Vec<_>>>()?;

        // The trailing item only carries a readTime
        assert_eq!(items.len(), 3);
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].id, "grp-a");
        assert!(documents[0].update_time.is_some());
        assert_eq!(documents[1].get("isTriggered"), Some(&Value::Boolean(false)));

        Ok(())
    }

    #[test]
    fn test_deserialize_users_page() -> Result<()> {
        let page: DocumentList = serde_json::from_str(EXAMPLE_USERS_PAGE)?;
        assert_eq!(page.documents.len(), 3);
        assert_eq!(page.next_page_token.as_deref(), Some("page-2"));
        let first = document_from_json(&page.documents[0])?;
        assert_eq!(first.id, "user-1");
        Ok(())
    }

    #[test]
    fn test_document_from_json_without_fields() -> Result<()> {
        let doc = document_from_json(&json!({
            "name": "projects/p/databases/(default)/documents/Developers/uid-1",
        }))?;
        assert_eq!(doc.id, "uid-1");
        assert!(doc.fields.is_empty());
        assert_eq!(doc.update_time, None);
        Ok(())
    }

    #[test]
    fn test_document_from_json_without_name() {
        assert!(document_from_json(&json!({ "fields": {} })).is_err());
    }

    #[test]
    fn test_document_name() {
        assert_eq!(
            format!("{}/{}", FIRESTORE_API, document_name(PROJECT, "Users", "u1")),
            "https://firestore.googleapis.com/v1/projects/cmms-test/databases/(default)/documents/Users/u1"
        );
    }

    #[test]
    fn test_update_write_json() {
        let mut fields = Fields::new();
        fields.insert("isTriggered".to_owned(), true.into());
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();

        let write = Write::Update {
            collection: "Notifications".to_owned(),
            id: "grp-a".to_owned(),
            fields,
            server_timestamps: vec!["triggeredAt".to_owned()],
            precondition: Some(Precondition::UpdateTime(ts)),
        };
        let body = write_to_json(PROJECT, &write);

        assert_eq!(
            body["update"]["name"],
            "projects/cmms-test/databases/(default)/documents/Notifications/grp-a"
        );
        assert_eq!(body["update"]["fields"]["isTriggered"], json!({ "booleanValue": true }));
        assert_eq!(body["updateMask"]["fieldPaths"], json!(["isTriggered"]));
        assert_eq!(
            body["updateTransforms"],
            json!([{ "fieldPath": "triggeredAt", "setToServerValue": "REQUEST_TIME" }])
        );
        assert_eq!(body["currentDocument"]["updateTime"], "2024-05-01T09:00:00Z");
    }

    #[test]
    fn test_update_write_json_without_extras() {
        let write = Write::Update {
            collection: "EmailNotifications".to_owned(),
            id: "e1".to_owned(),
            fields: Fields::new(),
            server_timestamps: vec![],
            precondition: None,
        };
        let body = write_to_json(PROJECT, &write);
        assert!(body.get("updateTransforms").is_none());
        assert!(body.get("currentDocument").is_none());
    }

    #[test]
    fn test_delete_write_json() {
        let write = Write::Delete {
            collection: "Notifications".to_owned(),
            id: "old".to_owned(),
        };
        assert_eq!(
            write_to_json(PROJECT, &write),
            json!({ "delete": "projects/cmms-test/databases/(default)/documents/Notifications/old" })
        );
    }

    #[test]
    fn test_due_query_body_shape() {
        let today = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let query = Query::new("Notifications")
            .filter("notificationDate", Operator::LessThanOrEqual, today)
            .filter("isTriggered", Operator::Equal, false);
        let body = json!({ "structuredQuery": query.to_structured_query() });
        let filters = &body["structuredQuery"]["where"]["compositeFilter"]["filters"];
        assert_eq!(
            filters[0]["fieldFilter"]["value"],
            json!({ "timestampValue": "2024-05-01T00:00:00Z" })
        );
        assert_eq!(filters[1]["fieldFilter"]["value"], json!({ "booleanValue": false }));
    }
}
