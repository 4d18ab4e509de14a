//! Node drain watcher built from two event-stream producers.

use std::collections::{BTreeMap, HashMap};

use nomad_stream_client::{Client, QueryOptions};
use nomad_stream_core::{Events, MonitorMessage, Topic};
use nomad_stream_monitor::{DrainMonitor, monitor_drain};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Batches = mpsc::Receiver<Result<Events, nomad_stream_client::EventStreamError>>;

pub fn watch(client: &Client, parent: &CancellationToken, node_id: &str) -> DrainMonitor {
    let node_client = client.clone();
    let node = node_id.to_string();
    let alloc_client = client.clone();
    let alloc_node = node_id.to_string();
    monitor_drain(
        parent,
        move |cancel, tx| watch_node(node_client, node, cancel, tx),
        move |cancel, tx| watch_allocs(alloc_client, alloc_node, cancel, tx),
    )
}

async fn subscribe(
    client: &Client,
    cancel: CancellationToken,
    topic: Topic,
    key: Option<&str>,
) -> Result<Batches, String> {
    let keys = key.map(|k| vec![k.to_string()]).unwrap_or_default();
    let topics = BTreeMap::from([(topic, keys)]);
    client
        .event_stream()
        .stream(cancel, &topics, 0, &QueryOptions::default())
        .await
        .map_err(|e| e.to_string())
}

async fn watch_node(
    client: Client,
    node_id: String,
    cancel: CancellationToken,
    tx: mpsc::Sender<MonitorMessage>,
) {
    let mut rx = match subscribe(&client, cancel, Topic::Node, Some(&node_id)).await {
        Ok(rx) => rx,
        Err(e) => {
            let _ = tx.send(MonitorMessage::error(format!("Error watching node: {e}"))).await;
            return;
        }
    };

    let mut draining = false;
    while let Some(batch) = rx.recv().await {
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                let _ = tx.send(MonitorMessage::error(format!("Error watching node: {e}"))).await;
                return;
            }
        };
        for event in &batch.events {
            let Ok(node) = event.decode_payload::<Value>() else {
                continue;
            };
            let has_strategy = !node["DrainStrategy"].is_null();
            if has_strategy && !draining {
                draining = true;
                let msg = MonitorMessage::info(format!("Node {node_id:?} is draining"));
                if tx.send(msg).await.is_err() {
                    return;
                }
            } else if !has_strategy && draining {
                let msg = MonitorMessage::info(format!("Node {node_id:?} drain complete"));
                let _ = tx.send(msg).await;
                return;
            }
        }
    }
}

const TERMINAL_CLIENT_STATUSES: [&str; 3] = ["complete", "failed", "lost"];

/// Last reported client status of each allocation on the node.
#[derive(Debug, Default)]
struct AllocStatuses(HashMap<String, String>);

impl AllocStatuses {
    /// Start from the node's allocation list.
    fn seed(allocs: &[Value]) -> Self {
        let mut statuses = Self::default();
        for alloc in allocs {
            statuses.update(&alloc["ID"], &alloc["ClientStatus"]);
        }
        statuses
    }

    /// Record a status; returns whether it changed.
    fn update(&mut self, id: &Value, status: &Value) -> bool {
        let id = id.as_str().unwrap_or_default();
        let status = status.as_str().unwrap_or_default();
        if self.0.get(id).is_some_and(|s| s == status) {
            return false;
        }
        self.0.insert(id.to_string(), status.to_string());
        true
    }

    fn all_stopped(&self) -> bool {
        self.0
            .values()
            .all(|s| TERMINAL_CLIENT_STATUSES.contains(&s.as_str()))
    }
}

async fn watch_allocs(
    client: Client,
    node_id: String,
    cancel: CancellationToken,
    tx: mpsc::Sender<MonitorMessage>,
) {
    let path = format!("/v1/node/{node_id}/allocations");
    let mut statuses = match client.query::<Vec<Value>>(&path, &QueryOptions::default()).await {
        Ok((allocs, _)) => AllocStatuses::seed(&allocs),
        Err(e) => {
            let _ = tx
                .send(MonitorMessage::error(format!("Error listing allocations: {e}")))
                .await;
            return;
        }
    };

    let mut rx = match subscribe(&client, cancel, Topic::Allocation, None).await {
        Ok(rx) => rx,
        Err(e) => {
            let _ = tx
                .send(MonitorMessage::error(format!("Error watching allocations: {e}")))
                .await;
            return;
        }
    };

    while let Some(batch) = rx.recv().await {
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                let _ = tx
                    .send(MonitorMessage::error(format!("Error watching allocations: {e}")))
                    .await;
                return;
            }
        };
        for event in &batch.events {
            let Ok(alloc) = event.decode_payload::<Value>() else {
                continue;
            };
            if alloc["NodeID"].as_str() != Some(node_id.as_str()) {
                continue;
            }
            if !statuses.update(&alloc["ID"], &alloc["ClientStatus"]) {
                continue;
            }

            let id = alloc["ID"].as_str().unwrap_or_default();
            let status = alloc["ClientStatus"].as_str().unwrap_or_default();
            let msg = MonitorMessage::new(
                nomad_stream_core::MonitorLevel::Normal,
                format!("Alloc {id:?} is {status}"),
            );
            if tx.send(msg).await.is_err() {
                return;
            }

            if statuses.all_stopped() {
                let msg = MonitorMessage::info(format!(
                    "All allocations on node {node_id:?} have stopped"
                ));
                let _ = tx.send(msg).await;
                return;
            }
        }
    }
}
