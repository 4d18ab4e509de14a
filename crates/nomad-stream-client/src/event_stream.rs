//! Event stream subscription.

use std::collections::BTreeMap;

use bytes::Bytes;
use futures::Stream;
use nomad_stream_core::{Events, Topic};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    Client,
    error::{ClientError, EventStreamError},
    ndjson::LineReader,
    request::QueryOptions,
};

/// Capacity of the channel returned by [`EventStream::stream`].
pub const EVENT_CHANNEL_CAPACITY: usize = 10;

/// Event stream endpoints.
pub struct EventStream<'a> {
    client: &'a Client,
}

impl Client {
    /// Event stream endpoints.
    #[must_use]
    pub const fn event_stream(&self) -> EventStream<'_> {
        EventStream { client: self }
    }
}

impl EventStream<'_> {
    /// Subscribe to `topics`, starting after raft index `index`.
    ///
    /// Each topic maps to the keys to filter on; an empty list subscribes
    /// to every key. The returned channel yields decoded batches with
    /// heartbeats removed. At most one `Err` is delivered, after which the
    /// channel closes. Cancelling `cancel` closes the channel and releases
    /// the connection.
    ///
    /// # Errors
    /// Returns error if the request cannot be sent or the server rejects it.
    pub async fn stream(
        &self,
        cancel: CancellationToken,
        topics: &BTreeMap<Topic, Vec<String>>,
        index: u64,
        q: &QueryOptions,
    ) -> Result<mpsc::Receiver<Result<Events, EventStreamError>>, ClientError> {
        let mut params = topic_params(topics);
        params.push(("index".to_string(), index.to_string()));

        let response = self
            .client
            .stream_get("/v1/event/stream", q, params)
            .await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(decode_events(Box::pin(response.bytes_stream()), cancel, tx));
        Ok(rx)
    }
}

fn topic_params(topics: &BTreeMap<Topic, Vec<String>>) -> Vec<(String, String)> {
    let mut params = Vec::new();
    for (topic, keys) in topics {
        if keys.is_empty() {
            params.push(("topic".to_string(), format!("{topic}:*")));
        }
        for key in keys {
            params.push(("topic".to_string(), format!("{topic}:{key}")));
        }
    }
    params
}

/// Decode newline-delimited event batches from `body` into `tx`.
///
/// Runs until cancellation, a delivered error, or the receiver going away.
pub(crate) async fn decode_events<S, E>(
    body: S,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<Events, EventStreamError>>,
) where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut lines = LineReader::new(body);
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };

        let item = match line {
            None => Err(EventStreamError::Closed),
            Some(Err(e)) => Err(EventStreamError::Body(Box::new(e))),
            Some(Ok(line)) => match serde_json::from_slice::<Events>(&line) {
                Ok(events) if events.is_heartbeat() => continue,
                Ok(events) => Ok(events),
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable event batch");
                    Err(EventStreamError::Decode(e))
                }
            },
        };
        let terminal = item.is_err();
        if let Ok(events) = &item {
            tracing::trace!(index = events.index, count = events.events.len(), "event batch");
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            sent = tx.send(item) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        if terminal {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use futures::stream;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path, query_param},
    };

    use super::*;
    use crate::Config;

    fn body(
        lines: &[&'static str],
    ) -> impl Stream<Item = Result<Bytes, io::Error>> + Unpin {
        stream::iter(
            lines
                .iter()
                .map(|l| Ok(Bytes::from_static(l.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_heartbeats_are_dropped() {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let input = body(&[
            "{}\n",
            r#"{"Index":7,"Events":[{"Topic":"Job","Type":"JobRegistered","Key":"web","Index":7}]}"#,
            "\n{}\n",
            r#"{"Index":8,"Events":[{"Topic":"Node","Type":"NodeDrain","Key":"n1","Index":8}]}"#,
            "\n",
        ]);
        decode_events(input, CancellationToken::new(), tx).await;

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.index, 7);
        assert_eq!(first.events[0].topic, Topic::Job);
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second.index, 8);
        assert!(matches!(rx.recv().await, Some(Err(EventStreamError::Closed))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_decode_error_delivered_once() {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let input = body(&["{\"Index\":1,\"Events\":[]}\n", "not json\n", "{}\n"]);
        decode_events(input, CancellationToken::new(), tx).await;

        assert_eq!(rx.recv().await.unwrap().unwrap().index, 1);
        assert!(matches!(rx.recv().await, Some(Err(EventStreamError::Decode(_)))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_body_error_delivered() {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let input = stream::iter(vec![Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        ))]);
        decode_events(input, CancellationToken::new(), tx).await;

        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, EventStreamError::Body(_)));
        assert!(err.to_string().contains("reset"));
    }

    #[tokio::test]
    async fn test_cancel_closes_channel_while_body_hangs() {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let hanging = stream::pending::<Result<Bytes, io::Error>>();
        let task = tokio::spawn(decode_events(hanging, cancel.clone(), tx));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_while_channel_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let input = body(&[
            "{\"Index\":1,\"Events\":[]}\n",
            "{\"Index\":2,\"Events\":[]}\n",
            "{\"Index\":3,\"Events\":[]}\n",
        ]);
        let task = tokio::spawn(decode_events(input, cancel.clone(), tx));

        tokio::task::yield_now().await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        while let Some(item) = rx.recv().await {
            assert!(item.is_ok());
        }
    }

    #[test]
    fn test_topic_params() {
        let topics = BTreeMap::from([
            (Topic::Job, vec!["web".to_string(), "api".to_string()]),
            (Topic::Node, Vec::new()),
        ]);
        assert_eq!(
            topic_params(&topics),
            vec![
                ("topic".to_string(), "Job:web".to_string()),
                ("topic".to_string(), "Job:api".to_string()),
                ("topic".to_string(), "Node:*".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_against_server() {
        let server = MockServer::start().await;
        let payload = format!(
            "{}\n{}\n",
            json!({"Index": 11, "Events": [{
                "Topic": "Deployment",
                "Type": "DeploymentStatusUpdate",
                "Key": "d1",
                "Index": 11,
                "Payload": {"Deployment": {"ID": "d1", "Status": "running"}}
            }]}),
            json!({})
        );
        Mock::given(method("GET"))
            .and(path("/v1/event/stream"))
            .and(query_param("topic", "Deployment:*"))
            .and(query_param("index", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_string(payload))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new(Config::default().with_address(server.uri())).unwrap();
        let topics = BTreeMap::from([(Topic::Deployment, Vec::new())]);
        let mut rx = client
            .event_stream()
            .stream(CancellationToken::new(), &topics, 10, &QueryOptions::default())
            .await
            .unwrap();

        let batch = rx.recv().await.unwrap().unwrap();
        assert_eq!(batch.index, 11);
        let deployment: serde_json::Value = batch.events[0].decode_payload().unwrap();
        assert_eq!(deployment["Status"], "running");
        assert!(matches!(rx.recv().await, Some(Err(EventStreamError::Closed))));
    }

    #[tokio::test]
    async fn test_wait_index_does_not_duplicate_stream_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/event/stream"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;

        let client = Client::new(Config::default().with_address(server.uri())).unwrap();
        let q = QueryOptions {
            wait_index: 5,
            ..QueryOptions::default()
        };
        let mut rx = client
            .event_stream()
            .stream(CancellationToken::new(), &BTreeMap::new(), 10, &q)
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Err(EventStreamError::Closed))));

        let requests = server.received_requests().await.unwrap();
        let indexes: Vec<_> = requests[0]
            .url
            .query_pairs()
            .filter(|(k, _)| k == "index")
            .map(|(_, v)| v.into_owned())
            .collect();
        assert_eq!(indexes, ["10"]);
    }

    #[tokio::test]
    async fn test_rejected_subscription_returns_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Permission denied"))
            .mount(&server)
            .await;

        let client = Client::new(Config::default().with_address(server.uri())).unwrap();
        let err = client
            .event_stream()
            .stream(
                CancellationToken::new(),
                &BTreeMap::new(),
                0,
                &QueryOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(reqwest::StatusCode::FORBIDDEN));
    }
}
