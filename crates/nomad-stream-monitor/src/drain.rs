//! Node drain monitoring pipeline.

use std::future::Future;

use nomad_stream_core::MonitorMessage;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::multiplex::multiplex;

const OUT_CAPACITY: usize = 8;
const NODE_CAPACITY: usize = 1;
const ALLOC_CAPACITY: usize = 8;

/// Running drain monitor.
///
/// `messages` closes after the last message. Cancelling `cancel` (or
/// receiving an error-level message) stops both producers.
pub struct DrainMonitor {
    pub messages: mpsc::Receiver<MonitorMessage>,
    pub cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl DrainMonitor {
    /// Consume the messages as a stream.
    ///
    /// Producers keep running in the background until they observe the
    /// token.
    #[must_use]
    pub fn into_stream(mut self) -> ReceiverStream<MonitorMessage> {
        self.tasks.detach_all();
        ReceiverStream::new(self.messages)
    }

    /// Stop the monitor and wait for the producers to return.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "drain monitor task failed");
            }
        }
    }
}

/// Run `node` and `alloc` producers and merge what they report.
///
/// Each producer gets a token derived from `parent` and its own sending
/// channel; it should return when the token is cancelled or when it has
/// nothing more to report. An error-level message from either producer
/// ends the whole monitor.
pub fn monitor_drain<N, NF, A, AF>(parent: &CancellationToken, node: N, alloc: A) -> DrainMonitor
where
    N: FnOnce(CancellationToken, mpsc::Sender<MonitorMessage>) -> NF,
    NF: Future<Output = ()> + Send + 'static,
    A: FnOnce(CancellationToken, mpsc::Sender<MonitorMessage>) -> AF,
    AF: Future<Output = ()> + Send + 'static,
{
    let cancel = parent.child_token();
    let (out_tx, out_rx) = mpsc::channel(OUT_CAPACITY);
    let (node_tx, node_rx) = mpsc::channel(NODE_CAPACITY);
    let (alloc_tx, alloc_rx) = mpsc::channel(ALLOC_CAPACITY);

    let mut tasks = JoinSet::new();
    tasks.spawn(node(cancel.clone(), node_tx));
    tasks.spawn(alloc(cancel.clone(), alloc_tx));
    tasks.spawn(multiplex(cancel.clone(), out_tx, node_rx, alloc_rx));

    DrainMonitor {
        messages: out_rx,
        cancel,
        tasks,
    }
}
