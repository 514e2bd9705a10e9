//! Background-side consumer of batched operations
//!
//! The coordinator owns the authoritative bucket writes: it applies a
//! coalesced batch to a container's bucket with last-write-wins by operation
//! timestamp, persists the result and answers with an acknowledgement.
//!
//! A batch whose every operation was rejected is answered with a failure so
//! the sender can tell it apart from one that changed nothing legitimately.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::batcher::BatchPayload;
use crate::entity::field_updates;
use crate::error::TransportError;
use crate::model::{OpType, PendingOperation, QuickTab};
use crate::protocol::{ErrorCode, Request, Response, Transport};
use crate::storage::{PersistentStore, DEFAULT_CONTAINER};

/// Apply a batch to a container bucket
pub const BATCH_UPDATE: &str = "BATCH_UPDATE";
/// Read a container bucket
pub const GET_STATE: &str = "GET_QUICK_TABS_STATE";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    #[serde(default)]
    container_id: Option<String>,
    batch: BatchPayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateRequest {
    #[serde(default)]
    container_id: Option<String>,
}

/// What happened to each operation of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    /// Older than the stored tab, or addressed to a missing tab
    pub skipped: usize,
    pub rejected: usize,
}

impl BatchReport {
    /// Read the counts back out of an acknowledgement's data
    pub fn from_ack(data: &Value) -> Option<Self> {
        let count = |key: &str| {
            data.get(key)
                .and_then(Value::as_u64)
                .and_then(|n| usize::try_from(n).ok())
        };
        Some(Self {
            applied: count("applied")?,
            skipped: count("skipped")?,
            rejected: count("rejected")?,
        })
    }

    /// Nothing applied and at least one operation rejected
    pub fn is_rejected(&self) -> bool {
        self.applied == 0 && self.rejected > 0
    }
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    store: Arc<PersistentStore>,
}

impl Coordinator {
    pub fn new(store: Arc<PersistentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    /// Apply every operation of `batch` to `container` and save once.
    ///
    /// The load, apply and save run under the container's write lock, so
    /// batches applied concurrently never overwrite each other.
    pub async fn apply_batch(&self, container: &str, batch: &BatchPayload) -> Response {
        let (report, outcome) = self
            .store
            .modify_bucket(container, |state| {
                let mut report = BatchReport::default();
                for op in &batch.operations {
                    match apply_operation(&mut state.tabs, op) {
                        Applied::Yes => report.applied += 1,
                        Applied::Skipped => report.skipped += 1,
                        Applied::Rejected => report.rejected += 1,
                    }
                }
                let write = !report.is_rejected();
                (report, write)
            })
            .await;

        let Some(outcome) = outcome else {
            warn!(
                container,
                rejected = report.rejected,
                skipped = report.skipped,
                "Batch rejected, bucket left untouched"
            );
            return Response::failure(
                ErrorCode::RemoteError,
                format!("all {} operations rejected", report.rejected),
            );
        };
        info!(
            container,
            applied = report.applied,
            skipped = report.skipped,
            rejected = report.rejected,
            durable = outcome.durable,
            ephemeral = outcome.ephemeral,
            "Batch applied"
        );

        if !outcome.any() {
            return Response::failure(ErrorCode::RemoteError, "batch could not be persisted");
        }
        Response::success(Some(json!({
            "applied": report.applied,
            "skipped": report.skipped,
            "rejected": report.rejected,
            "correlationIds": batch.correlation_ids,
        })))
    }

    /// Answer one request with a response envelope
    pub async fn handle_request(&self, request: Request) -> Value {
        let response = match request.action.as_str() {
            BATCH_UPDATE => match serde_json::from_value::<BatchRequest>(request.payload) {
                Ok(payload) => {
                    let container = payload
                        .container_id
                        .unwrap_or_else(|| DEFAULT_CONTAINER.to_string());
                    self.apply_batch(&container, &payload.batch).await
                }
                Err(error) => {
                    warn!(%error, "Malformed batch request");
                    Response::failure(ErrorCode::RemoteError, format!("malformed batch: {error}"))
                }
            },
            GET_STATE => {
                let payload: StateRequest =
                    serde_json::from_value(request.payload).unwrap_or_default();
                let container = payload
                    .container_id
                    .unwrap_or_else(|| DEFAULT_CONTAINER.to_string());
                let state = self.store.load(&container).await;
                match serde_json::to_value(state) {
                    Ok(data) => Response::success(Some(data)),
                    Err(error) => Response::failure(ErrorCode::RemoteError, error.to_string()),
                }
            }
            other => {
                debug!(action = other, "Unknown action");
                Response::failure(ErrorCode::RemoteError, format!("unknown action: {other}"))
            }
        };

        let envelope = response.with_request_id(request.request_id).into_envelope();
        serde_json::to_value(envelope).unwrap_or(Value::Null)
    }
}

#[async_trait]
impl Transport for Coordinator {
    async fn send(&self, request: Request) -> Result<Value, TransportError> {
        Ok(self.handle_request(request).await)
    }
}

enum Applied {
    Yes,
    Skipped,
    Rejected,
}

fn apply_operation(tabs: &mut Vec<QuickTab>, op: &PendingOperation) -> Applied {
    let index = tabs.iter().position(|tab| tab.id == op.quick_tab_id);
    match op.op_type {
        OpType::Create => match QuickTab::from_value(&op.data) {
            Ok(mut tab) => {
                // Updates coalesced into a create arrive as top-level field keys
                for (field, value) in field_updates(&flat_keys(&op.data)) {
                    if let Err(reason) = tab.set_field(field, value) {
                        warn!(id = %op.quick_tab_id, field = field.key(), %reason, "Rejected field in batch");
                    }
                }
                match index {
                    Some(i) => tabs[i] = tab,
                    None => tabs.push(tab),
                }
                Applied::Yes
            }
            Err(error) => {
                warn!(id = %op.quick_tab_id, %error, "Rejected create in batch");
                Applied::Rejected
            }
        },
        OpType::Update => {
            let Some(i) = index else {
                debug!(id = %op.quick_tab_id, "Update for unknown tab skipped");
                return Applied::Skipped;
            };
            let tab = &mut tabs[i];
            if op.timestamp < tab.last_modified {
                debug!(
                    id = %op.quick_tab_id,
                    op = op.timestamp,
                    stored = tab.last_modified,
                    "Stale update skipped"
                );
                return Applied::Skipped;
            }
            for (field, value) in field_updates(&op.data) {
                if let Err(reason) = tab.set_field(field, value) {
                    warn!(id = %op.quick_tab_id, field = field.key(), %reason, "Rejected field in batch");
                }
            }
            tab.touch(op.timestamp);
            Applied::Yes
        }
        OpType::Delete => match index {
            Some(i) => {
                tabs.remove(i);
                Applied::Yes
            }
            None => Applied::Skipped,
        },
    }
}

/// Drop the nested entity objects so only flat field keys remain
fn flat_keys(data: &Value) -> Value {
    match data {
        Value::Object(object) => Value::Object(
            object
                .iter()
                .filter(|(key, _)| !matches!(key.as_str(), "position" | "size" | "visibility"))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Position, Size};
    use crate::protocol::{normalize_response, RequestId};
    use crate::testing::YieldingArea;

    fn tab(id: &str) -> QuickTab {
        QuickTab::new(
            id,
            format!("https://example.com/{id}"),
            Position::new(0.0, 0.0),
            Size::new(200.0, 200.0),
        )
        .unwrap()
    }

    fn batch(operations: Vec<PendingOperation>) -> BatchPayload {
        BatchPayload {
            original_count: operations.len(),
            coalesced_count: operations.len(),
            operations,
            window_duration: 50,
            extensions: 0,
            pruned_count: 0,
            correlation_ids: vec!["c-1".into()],
        }
    }

    #[tokio::test]
    async fn test_apply_batch_round() {
        let coordinator = Coordinator::new(Arc::new(PersistentStore::in_memory()));
        let a = tab("a");
        let create = PendingOperation::new("a", OpType::Create, serde_json::to_value(&a).unwrap());
        let response = coordinator.apply_batch("c1", &batch(vec![create])).await;
        assert!(response.is_success());
        assert_eq!(response.data().unwrap()["correlationIds"], json!(["c-1"]));

        let update = PendingOperation::new("a", OpType::Update, json!({ "left": 42 }))
            .at(a.last_modified + 10);
        coordinator.apply_batch("c1", &batch(vec![update])).await;

        let stored = coordinator.store().load("c1").await;
        assert_eq!(stored.tabs[0].position.left, 42.0);
        assert_eq!(stored.tabs[0].last_modified, a.last_modified + 10);
    }

    #[tokio::test]
    async fn test_create_carries_coalesced_updates() {
        let coordinator = Coordinator::new(Arc::new(PersistentStore::in_memory()));
        let a = tab("a");
        let ops = vec![
            PendingOperation::new("a", OpType::Create, serde_json::to_value(&a).unwrap()),
            PendingOperation::new("a", OpType::Update, json!({ "left": 7, "minimized": true })),
        ];
        let merged = crate::batcher::coalesce(ops);
        assert_eq!(merged.len(), 1);

        coordinator.apply_batch("c1", &batch(merged)).await;
        let stored = coordinator.store().load("c1").await;
        assert_eq!(stored.tabs[0].position.left, 7.0);
        assert!(stored.tabs[0].is_minimized());
    }

    #[tokio::test]
    async fn test_create_keeps_unmentioned_position_members() {
        let coordinator = Coordinator::new(Arc::new(PersistentStore::in_memory()));
        let mut a = tab("a");
        a.position = Position::new(10.0, 20.0);
        let ops = vec![
            PendingOperation::new("a", OpType::Create, serde_json::to_value(&a).unwrap()),
            PendingOperation::new("a", OpType::Update, json!({ "position": { "left": 50 } })),
        ];

        let response = coordinator
            .apply_batch("c1", &batch(crate::batcher::coalesce(ops)))
            .await;
        assert_eq!(response.data().unwrap()["applied"], json!(1));

        let stored = coordinator.store().load("c1").await;
        assert_eq!(stored.tabs[0].position, Position::new(50.0, 20.0));
    }

    #[tokio::test]
    async fn test_concurrent_batches_are_both_kept() {
        let store = Arc::new(PersistentStore::new(
            Arc::new(YieldingArea::new("durable")),
            Arc::new(YieldingArea::new("ephemeral")),
        ));
        let coordinator = Coordinator::new(store);
        let create = |id: &str| {
            let value = serde_json::to_value(tab(id)).unwrap();
            batch(vec![PendingOperation::new(id, OpType::Create, value)])
        };
        let (first, second) = (create("a"), create("b"));

        let (r1, r2) = tokio::join!(
            coordinator.apply_batch("c1", &first),
            coordinator.apply_batch("c1", &second),
        );
        assert!(r1.is_success() && r2.is_success());

        let mut ids: Vec<_> = coordinator
            .store()
            .load("c1")
            .await
            .tabs
            .into_iter()
            .map(|t| t.id)
            .collect();
        ids.sort();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_fully_rejected_batch_fails() {
        let store = Arc::new(PersistentStore::in_memory());
        store.save("c1", vec![tab("a")]).await;
        let before = store.load("c1").await;
        let coordinator = Coordinator::new(Arc::clone(&store));

        let invalid = PendingOperation::new("b", OpType::Create, json!({ "id": "b" }));
        let response = coordinator.apply_batch("c1", &batch(vec![invalid])).await;
        assert!(!response.is_success());
        assert_eq!(response.code(), Some(ErrorCode::RemoteError));
        assert_eq!(store.load("c1").await, before);

        // One good operation is enough to land the batch
        let invalid = PendingOperation::new("b", OpType::Create, json!({ "id": "b" }));
        let delete = PendingOperation::new("a", OpType::Delete, Value::Null);
        let response = coordinator
            .apply_batch("c1", &batch(vec![invalid, delete]))
            .await;
        let report = BatchReport::from_ack(response.data().unwrap()).unwrap();
        assert_eq!(
            report,
            BatchReport {
                applied: 1,
                skipped: 0,
                rejected: 1
            }
        );
    }

    #[tokio::test]
    async fn test_stale_update_is_skipped() {
        let store = Arc::new(PersistentStore::in_memory());
        let mut a = tab("a");
        a.last_modified = 5_000;
        store.save("c1", vec![a]).await;

        let coordinator = Coordinator::new(store);
        let stale = PendingOperation::new("a", OpType::Update, json!({ "left": 1 })).at(4_000);
        let response = coordinator.apply_batch("c1", &batch(vec![stale])).await;
        assert_eq!(response.data().unwrap()["skipped"], json!(1));
        assert_eq!(coordinator.store().load("c1").await.tabs[0].position.left, 0.0);
    }

    #[tokio::test]
    async fn test_delete_removes_tab() {
        let store = Arc::new(PersistentStore::in_memory());
        store.save("c1", vec![tab("a"), tab("b")]).await;
        let coordinator = Coordinator::new(store);

        let delete = PendingOperation::new("a", OpType::Delete, Value::Null);
        coordinator.apply_batch("c1", &batch(vec![delete])).await;
        let ids: Vec<_> = coordinator
            .store()
            .load("c1")
            .await
            .tabs
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, ["b"]);
    }

    #[tokio::test]
    async fn test_handle_request_envelopes() {
        let coordinator = Coordinator::new(Arc::new(PersistentStore::in_memory()));

        let request = Request {
            request_id: RequestId::new("req-1"),
            action: "NOPE".into(),
            payload: Value::Null,
        };
        let raw = coordinator.handle_request(request).await;
        assert_eq!(raw["success"], json!(false));
        assert_eq!(raw["requestId"], json!("req-1"));
        assert_eq!(normalize_response(raw).code(), Some(ErrorCode::RemoteError));

        let request = Request {
            request_id: RequestId::new("req-2"),
            action: BATCH_UPDATE.into(),
            payload: json!({ "containerId": "c9", "batch": batch(vec![]) }),
        };
        let raw = coordinator.handle_request(request).await;
        assert_eq!(raw["success"], json!(true));

        let request = Request {
            request_id: RequestId::new("req-3"),
            action: GET_STATE.into(),
            payload: json!({ "containerId": "c9" }),
        };
        let raw = coordinator.handle_request(request).await;
        assert_eq!(raw["data"]["tabs"], json!([]));
    }
}
