//! Remote document ledger contract.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use fieldsync_common::{AgentId, Error, Result};

/// Document fields.
pub type Fields = Map<String, Value>;

/// Live view of the newest active document: `None` when there is none.
pub type ActiveSnapshots = BoxStream<'static, Result<Option<LedgerDocument>>>;

/// `{collection}/{agent}/{subcollection}` addressing of an agent's records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    pub collection: String,
    pub agent_id: AgentId,
    pub subcollection: String,
}

impl DocumentPath {
    pub fn new(
        collection: impl Into<String>,
        agent_id: AgentId,
        subcollection: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            agent_id,
            subcollection: subcollection.into(),
        }
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.collection, self.agent_id, self.subcollection)
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerDocument {
    pub id: String,
    pub fields: Fields,
}

impl LedgerDocument {
    /// Decode the fields, with the document id available as `id`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let mut fields = self.fields.clone();
        fields.insert("id".to_string(), Value::String(self.id.clone()));
        Ok(serde_json::from_value(Value::Object(fields))?)
    }

    pub fn status(&self) -> Option<&str> {
        self.fields.get("status").and_then(Value::as_str)
    }
}

/// Fields to create or merge, plus fields the ledger stamps with its own clock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerWrite {
    pub fields: Fields,
    pub server_timestamps: Vec<String>,
}

impl LedgerWrite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a write from every field of a serializable value.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(fields) => Ok(Self {
                fields,
                server_timestamps: Vec::new(),
            }),
            other => Err(Error::Serialization(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn without(mut self, key: &str) -> Self {
        self.fields.remove(key);
        self
    }

    /// Let the ledger assign `key` from its clock.
    pub fn server_timestamp(mut self, key: impl Into<String>) -> Self {
        self.server_timestamps.push(key.into());
        self
    }
}

/// The remote system of record.
#[async_trait]
pub trait RemoteLedger: Send + Sync {
    /// Create a document and return its id.
    async fn create(&self, path: &DocumentPath, write: LedgerWrite) -> Result<String>;

    /// Merge fields into an existing document.
    async fn update(&self, path: &DocumentPath, id: &str, write: LedgerWrite) -> Result<()>;

    /// Newest document with `status == "active"`, ordered by `order_by` descending.
    async fn query_active(&self, path: &DocumentPath, order_by: &str)
        -> Result<Option<LedgerDocument>>;

    /// Live version of [`RemoteLedger::query_active`].
    ///
    /// Yields the current result first, then every change. An `Err` item ends
    /// the subscription.
    fn subscribe_active(&self, path: &DocumentPath, order_by: &str) -> ActiveSnapshots;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        #[serde(default)]
        id: Option<String>,
        start_time: String,
        status: String,
    }

    #[test]
    fn test_path_display() {
        let path = DocumentPath::new("agents", AgentId::new("a-1").unwrap(), "trips");
        assert_eq!(path.to_string(), "agents/a-1/trips");
    }

    #[test]
    fn test_decode_carries_id() {
        let write = LedgerWrite::from_value(&Sample {
            id: None,
            start_time: "t".into(),
            status: "active".into(),
        })
        .unwrap();
        let doc = LedgerDocument {
            id: "doc-1".into(),
            fields: write.fields,
        };

        assert_eq!(doc.status(), Some("active"));
        let decoded: Sample = doc.decode().unwrap();
        assert_eq!(decoded.id.as_deref(), Some("doc-1"));
    }

    #[test]
    fn test_write_builder() {
        let write = LedgerWrite::new()
            .set("status", "completed")
            .set("totalDistance", 1.5)
            .server_timestamp("endTime");
        assert_eq!(write.fields["status"], "completed");
        assert_eq!(write.server_timestamps, vec!["endTime".to_string()]);
        assert!(LedgerWrite::from_value(&3).is_err());
    }
}
