//! In-memory stand-ins for the document store and push service.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::fcm::PushSender;
use crate::message::Message;
use crate::store::{
    Document, DocumentStore, Fields, PreconditionFailed, Precondition, Query, Value, Write,
    WriteBatch,
};

type Key = (String, String);

pub struct MemoryStore {
    docs: Mutex<BTreeMap<Key, Document>>,
    clock: Mutex<DateTime<Utc>>,
    reads: AtomicUsize,
    fail_queries: AtomicBool,
    fail_commits: AtomicBool,
    commits: AtomicUsize,
    failing_commit: Mutex<Option<usize>>,
    failing_gets: Mutex<HashSet<Key>>,
    failing_lists: Mutex<HashSet<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            docs: Mutex::new(BTreeMap::new()),
            clock: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            reads: AtomicUsize::new(0),
            fail_queries: AtomicBool::new(false),
            fail_commits: AtomicBool::new(false),
            commits: AtomicUsize::new(0),
            failing_commit: Mutex::new(None),
            failing_gets: Mutex::new(HashSet::new()),
            failing_lists: Mutex::new(HashSet::new()),
        }
    }
}

impl MemoryStore {
    fn tick(&self) -> DateTime<Utc> {
        let mut clock = self.clock.lock().unwrap();
        *clock += Duration::microseconds(1);
        *clock
    }

    pub fn insert(&self, collection: &str, id: &str, fields: Fields) {
        let update_time = self.tick();
        self.docs.lock().unwrap().insert(
            (collection.to_owned(), id.to_owned()),
            Document {
                id: id.to_owned(),
                fields,
                update_time: Some(update_time),
            },
        );
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.docs
            .lock()
            .unwrap()
            .get(&(collection.to_owned(), id.to_owned()))
            .cloned()
    }

    pub fn ids(&self, collection: &str) -> Vec<String> {
        self.docs
            .lock()
            .unwrap()
            .keys()
            .filter(|(c, _)| c == collection)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn fail_queries(&self) {
        self.fail_queries.store(true, Ordering::SeqCst);
    }

    pub fn fail_commits(&self) {
        self.fail_commits.store(true, Ordering::SeqCst);
    }

    /// Fails only the `n`th non-empty commit, counting from 1.
    pub fn fail_nth_commit(&self, n: usize) {
        *self.failing_commit.lock().unwrap() = Some(n);
    }

    pub fn fail_get(&self, collection: &str, id: &str) {
        self.failing_gets
            .lock()
            .unwrap()
            .insert((collection.to_owned(), id.to_owned()));
    }

    pub fn fail_list(&self, collection: &str) {
        self.failing_lists
            .lock()
            .unwrap()
            .insert(collection.to_owned());
    }

    fn check(docs: &BTreeMap<Key, Document>, write: &Write) -> Result<()> {
        let Write::Update {
            collection,
            id,
            precondition: Some(precondition),
            ..
        } = write
        else {
            return Ok(());
        };
        let existing = docs.get(&(collection.clone(), id.clone()));
        let holds = match precondition {
            Precondition::Exists(exists) => existing.is_some() == *exists,
            Precondition::UpdateTime(ts) => existing.and_then(|d| d.update_time) == Some(*ts),
        };
        if holds {
            Ok(())
        } else {
            Err(PreconditionFailed(format!("{collection}/{id}")).into())
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn run_query(&self, query: &Query) -> Result<Vec<Document>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(anyhow!("query unavailable"));
        }
        Ok(self
            .docs
            .lock()
            .unwrap()
            .iter()
            .filter(|((c, _), doc)| *c == query.collection && query.matches(doc))
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let key = (collection.to_owned(), id.to_owned());
        if self.failing_gets.lock().unwrap().contains(&key) {
            return Err(anyhow!("lookup of {collection}/{id} failed"));
        }
        Ok(self.docs.lock().unwrap().get(&key).cloned())
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<Document>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst)
            || self.failing_lists.lock().unwrap().contains(collection)
        {
            return Err(anyhow!("list of {collection} unavailable"));
        }
        Ok(self
            .docs
            .lock()
            .unwrap()
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_commits.load(Ordering::SeqCst)
            || *self.failing_commit.lock().unwrap() == Some(n)
        {
            return Err(anyhow!("commit unavailable"));
        }
        let now = self.tick();
        let mut docs = self.docs.lock().unwrap();
        for write in batch.writes() {
            Self::check(&docs, write)?;
        }
        for write in batch.into_writes() {
            match write {
                Write::Update {
                    collection,
                    id,
                    fields,
                    server_timestamps,
                    ..
                } => {
                    let doc = docs
                        .entry((collection, id.clone()))
                        .or_insert_with(|| Document::new(id, Fields::new()));
                    doc.fields.extend(fields);
                    for field in server_timestamps {
                        doc.fields.insert(field, Value::Timestamp(now));
                    }
                    doc.update_time = Some(now);
                }
                Write::Delete { collection, id } => {
                    docs.remove(&(collection, id));
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPush {
    sent: Mutex<Vec<Message>>,
    failing: HashSet<String>,
}

impl RecordingPush {
    pub fn failing(tokens: &[&str]) -> Self {
        Self {
            sent: Mutex::new(vec![]),
            failing: tokens.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_tokens(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| m.token)
            .collect()
    }
}

#[async_trait]
impl PushSender for RecordingPush {
    async fn send(&self, message: &Message) -> Result<String> {
        let token = message.token.clone().unwrap_or_default();
        if self.failing.contains(&token) {
            return Err(anyhow!("registration-token-not-registered"));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        Ok(format!("projects/test/messages/{}", sent.len()))
    }
}

pub fn user_fields(token: Option<&str>, email: Option<&str>, enabled: Option<bool>) -> Fields {
    let mut fields = Fields::new();
    if let Some(t) = token {
        fields.insert("fcmToken".to_owned(), t.into());
    } else {
        fields.insert("fcmToken".to_owned(), Value::Null);
    }
    if let Some(e) = email {
        fields.insert("email".to_owned(), e.into());
    }
    if let Some(enabled) = enabled {
        fields.insert("notificationsEnabled".to_owned(), enabled.into());
    }
    fields
}

pub fn group_fields(date: DateTime<Utc>, triggered: bool, categories: &[&str]) -> Fields {
    let notifications = categories
        .iter()
        .map(|c| {
            let mut n = Fields::new();
            n.insert("category".to_owned(), (*c).into());
            n.insert("component".to_owned(), format!("{c} unit").into());
            n.insert("isTriggered".to_owned(), triggered.into());
            Value::Map(n)
        })
        .collect();

    let mut fields = Fields::new();
    fields.insert("notificationDate".to_owned(), date.into());
    fields.insert("isTriggered".to_owned(), triggered.into());
    fields.insert("notifications".to_owned(), Value::Array(notifications));
    fields
}
