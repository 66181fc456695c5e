use std::cmp::Ordering;
use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, json};

/// Per-commit write limit of the document store.
pub const MAX_BATCH_WRITES: usize = 500;

pub type Fields = BTreeMap<String, Value>;

/// A typed document field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(DateTime<Utc>),
    String(String),
    Array(Vec<Value>),
    Map(Fields),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            Value::Map(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Encodes into the REST wire form, e.g. `{"stringValue": "HVAC"}`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => json!({ "nullValue": null }),
            Value::Boolean(b) => json!({ "booleanValue": b }),
            Value::Integer(i) => json!({ "integerValue": i.to_string() }),
            Value::Double(d) => json!({ "doubleValue": d }),
            Value::Timestamp(ts) => json!({ "timestampValue": format_timestamp(ts) }),
            Value::String(s) => json!({ "stringValue": s }),
            Value::Array(values) => {
                let values: Vec<_> = values.iter().map(Value::to_json).collect();
                json!({ "arrayValue": { "values": values } })
            }
            Value::Map(fields) => json!({ "mapValue": { "fields": fields_to_json(fields) } }),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| anyhow!("Expected a typed value object, got {value}"))?;
        let (kind, inner) = obj
            .iter()
            .next()
            .ok_or_else(|| anyhow!("Empty typed value object"))?;

        let parsed = match kind.as_str() {
            "nullValue" => Value::Null,
            "booleanValue" => Value::Boolean(
                inner
                    .as_bool()
                    .ok_or_else(|| anyhow!("Invalid booleanValue: {inner}"))?,
            ),
            "integerValue" => {
                // int64 travels as a decimal string, but accept bare numbers too
                let i = match inner {
                    serde_json::Value::String(s) => s
                        .parse::<i64>()
                        .with_context(|| format!("Invalid integerValue: {s}"))?,
                    other => other
                        .as_i64()
                        .ok_or_else(|| anyhow!("Invalid integerValue: {other}"))?,
                };
                Value::Integer(i)
            }
            "doubleValue" => Value::Double(
                inner
                    .as_f64()
                    .ok_or_else(|| anyhow!("Invalid doubleValue: {inner}"))?,
            ),
            "timestampValue" => {
                let s = inner
                    .as_str()
                    .ok_or_else(|| anyhow!("Invalid timestampValue: {inner}"))?;
                Value::Timestamp(parse_timestamp(s)?)
            }
            "stringValue" => Value::String(
                inner
                    .as_str()
                    .ok_or_else(|| anyhow!("Invalid stringValue: {inner}"))?
                    .to_owned(),
            ),
            "arrayValue" => {
                let values = match inner.get("values") {
                    Some(serde_json::Value::Array(values)) => values
                        .iter()
                        .map(Value::from_json)
                        .collect::<Result<Vec<_>>>()?,
                    Some(other) => bail!("Invalid arrayValue: {other}"),
                    None => vec![],
                };
                Value::Array(values)
            }
            "mapValue" => match inner.get("fields") {
                Some(fields) => Value::Map(fields_from_json(fields)?),
                None => Value::Map(Fields::new()),
            },
            other => bail!("Unsupported value kind: {other}"),
        };

        Ok(parsed)
    }

    fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
            (Value::Double(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl From<Fields> for Value {
    fn from(value: Fields) -> Self {
        Value::Map(value)
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {s}"))?
        .with_timezone(&Utc))
}

pub fn fields_to_json(fields: &Fields) -> serde_json::Value {
    let map: Map<String, serde_json::Value> = fields
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    serde_json::Value::Object(map)
}

pub fn fields_from_json(value: &serde_json::Value) -> Result<Fields> {
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("Expected a fields object, got {value}"))?;
    obj.iter()
        .map(|(k, v)| {
            Value::from_json(v)
                .with_context(|| format!("Field {k}"))
                .map(|v| (k.clone(), v))
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
    pub update_time: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
            update_time: None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Equal,
    NotEqual,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "LESS_THAN",
            Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            Operator::Equal => "EQUAL",
            Operator::NotEqual => "NOT_EQUAL",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

impl FieldFilter {
    /// Evaluates the filter the way the store does: missing fields and values
    /// of a different type never match.
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = doc.get(&self.field) else {
            return false;
        };
        let Some(ordering) = actual.compare(&self.value) else {
            return false;
        };
        match self.op {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::NotEqual => ordering != Ordering::Equal,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "fieldFilter": {
                "field": { "fieldPath": self.field },
                "op": self.op.as_str(),
                "value": self.value.to_json(),
            }
        })
    }
}

/// A single-collection query whose filters are ANDed together.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<FieldFilter>,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: vec![],
        }
    }

    pub fn filter(mut self, field: &str, op: Operator, value: impl Into<Value>) -> Self {
        self.filters.push(FieldFilter {
            field: field.to_owned(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    pub fn to_structured_query(&self) -> serde_json::Value {
        let mut query = json!({ "from": [{ "collectionId": self.collection }] });

        let filter = match self.filters.as_slice() {
            [] => None,
            [single] => Some(single.to_json()),
            filters => Some(json!({
                "compositeFilter": {
                    "op": "AND",
                    "filters": filters.iter().map(FieldFilter::to_json).collect::<Vec<_>>(),
                }
            })),
        };
        if let Some(filter) = filter {
            query["where"] = filter;
        }

        query
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    Exists(bool),
    UpdateTime(DateTime<Utc>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Write {
    /// Sets `fields` (and only those) on the document, creating it if absent
    /// unless a precondition says otherwise.
    Update {
        collection: String,
        id: String,
        fields: Fields,
        server_timestamps: Vec<String>,
        precondition: Option<Precondition>,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// Writes applied atomically by a single commit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, collection: &str, id: &str, fields: Fields) -> &mut Self {
        self.push_update(collection, id, fields, vec![], None)
    }

    pub fn push_update(
        &mut self,
        collection: &str,
        id: &str,
        fields: Fields,
        server_timestamps: Vec<String>,
        precondition: Option<Precondition>,
    ) -> &mut Self {
        self.writes.push(Write::Update {
            collection: collection.to_owned(),
            id: id.to_owned(),
            fields,
            server_timestamps,
            precondition,
        });
        self
    }

    pub fn delete(&mut self, collection: &str, id: &str) -> &mut Self {
        self.writes.push(Write::Delete {
            collection: collection.to_owned(),
            id: id.to_owned(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<Write> {
        self.writes
    }
}

/// Returned (inside `anyhow::Error`) when a write's precondition does not hold.
#[derive(Debug, thiserror::Error)]
#[error("Precondition failed: {0}")]
pub struct PreconditionFailed(pub String);

pub fn is_precondition_failure(err: &anyhow::Error) -> bool {
    err.downcast_ref::<PreconditionFailed>().is_some()
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn run_query(&self, query: &Query) -> Result<Vec<Document>>;

    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    async fn list_documents(&self, collection: &str) -> Result<Vec<Document>>;

    /// Applies the batch all-or-nothing. Fails with [`PreconditionFailed`] when
    /// any write's precondition does not hold.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;
}
