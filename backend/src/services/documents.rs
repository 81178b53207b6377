// Document data layer
//
// Generic model/document storage used by data actions and the script `db`
// bridge. Every successful mutation is published as a DataEvent so that
// triggers can react to it.

use async_trait::async_trait;
use flowcore_shared::{DataEvent, DataEventKind, User};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{WorkflowError, WorkflowResult};

pub type DataEventSender = mpsc::UnboundedSender<DataEvent>;
pub type DataEventReceiver = mpsc::UnboundedReceiver<DataEvent>;

const FIND_LIMIT: i64 = 1000;

#[async_trait]
pub trait DataLayer: Send + Sync {
    /// Insert a document, returning its id.
    async fn create(&self, model: &str, data: Value, user: Option<&User>) -> WorkflowResult<Uuid>;

    /// Merge `patch` into every document matching `selector`.
    async fn update(
        &self,
        model: &str,
        selector: Value,
        patch: Value,
        user: Option<&User>,
    ) -> WorkflowResult<u64>;

    async fn delete(&self, model: &str, selector: Value, user: Option<&User>) -> WorkflowResult<u64>;

    async fn find(&self, model: &str, selector: Value, user: Option<&User>) -> WorkflowResult<Vec<Value>>;
}

/// A selector split into the document id and a JSONB containment filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub id: Option<Uuid>,
    pub contains: Map<String, Value>,
}

impl Selector {
    /// `Ok(None)` when `_id` is present but can never match.
    pub fn parse(selector: Value) -> WorkflowResult<Option<Self>> {
        let mut contains = match selector {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(WorkflowError::DataLayer(format!(
                    "selector must be an object, got {}",
                    other
                )))
            }
        };

        let id = match contains.remove("_id") {
            None => None,
            Some(Value::String(raw)) => match Uuid::parse_str(&raw) {
                Ok(id) => Some(id),
                Err(_) => return Ok(None),
            },
            Some(_) => return Ok(None),
        };

        Ok(Some(Self { id, contains }))
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.contains.is_empty()
    }
}

fn object(value: Value, what: &str) -> WorkflowResult<Map<String, Value>> {
    match value {
        Value::Object(mut map) => {
            map.remove("_id");
            Ok(map)
        }
        other => Err(WorkflowError::DataLayer(format!(
            "{} must be an object, got {}",
            what, other
        ))),
    }
}

fn with_id(id: Uuid, data: Value) -> Value {
    let mut map = match data {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.insert("_id".to_string(), Value::String(id.to_string()));
    Value::Object(map)
}

#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    events: Option<DataEventSender>,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, events: None }
    }

    pub fn with_events(mut self, events: DataEventSender) -> Self {
        self.events = Some(events);
        self
    }

    fn publish(&self, kind: DataEventKind, model: &str, document: Value, user: Option<&User>) {
        if let Some(events) = &self.events {
            let event = DataEvent::new(kind, model, document, user.cloned());
            if events.send(event).is_err() {
                warn!("Data event dispatcher is gone, dropping {} on {}", kind, model);
            }
        }
    }
}

#[async_trait]
impl DataLayer for PgDocumentStore {
    async fn create(&self, model: &str, data: Value, user: Option<&User>) -> WorkflowResult<Uuid> {
        let data = Value::Object(object(data, "document")?);
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO documents (id, model, data, created_by) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(model)
        .bind(&data)
        .bind(user.map(|u| u.id))
        .execute(&self.pool)
        .await?;

        debug!("Created {} document {}", model, id);
        self.publish(DataEventKind::DataAdded, model, with_id(id, data), user);
        Ok(id)
    }

    async fn update(
        &self,
        model: &str,
        selector: Value,
        patch: Value,
        user: Option<&User>,
    ) -> WorkflowResult<u64> {
        let Some(selector) = Selector::parse(selector)? else {
            return Ok(0);
        };
        if selector.is_empty() {
            return Err(WorkflowError::DataLayer(
                "refusing to update with an empty selector".to_string(),
            ));
        }
        let patch = Value::Object(object(patch, "update")?);

        let rows = sqlx::query(
            r#"
            UPDATE documents SET data = data || $2, updated_at = NOW()
            WHERE model = $1 AND data @> $3 AND ($4::uuid IS NULL OR id = $4)
            RETURNING id, data
            "#,
        )
        .bind(model)
        .bind(&patch)
        .bind(Value::Object(selector.contains))
        .bind(selector.id)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let data: Value = row.try_get("data")?;
            self.publish(DataEventKind::DataEdited, model, with_id(id, data), user);
        }

        Ok(rows.len() as u64)
    }

    async fn delete(&self, model: &str, selector: Value, user: Option<&User>) -> WorkflowResult<u64> {
        let Some(selector) = Selector::parse(selector)? else {
            return Ok(0);
        };
        if selector.is_empty() {
            return Err(WorkflowError::DataLayer(
                "refusing to delete with an empty selector".to_string(),
            ));
        }

        let rows = sqlx::query(
            r#"
            DELETE FROM documents
            WHERE model = $1 AND data @> $2 AND ($3::uuid IS NULL OR id = $3)
            RETURNING id, data
            "#,
        )
        .bind(model)
        .bind(Value::Object(selector.contains))
        .bind(selector.id)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let data: Value = row.try_get("data")?;
            self.publish(DataEventKind::DataDeleted, model, with_id(id, data), user);
        }

        Ok(rows.len() as u64)
    }

    async fn find(&self, model: &str, selector: Value, _user: Option<&User>) -> WorkflowResult<Vec<Value>> {
        let Some(selector) = Selector::parse(selector)? else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT id, data FROM documents
            WHERE model = $1 AND data @> $2 AND ($3::uuid IS NULL OR id = $3)
            ORDER BY created_at
            LIMIT $4
            "#,
        )
        .bind(model)
        .bind(Value::Object(selector.contains))
        .bind(selector.id)
        .bind(FIND_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> WorkflowResult<Value> {
                let id: Uuid = row.try_get("id")?;
                let data: Value = row.try_get("data")?;
                Ok(with_id(id, data))
            })
            .collect()
    }
}
