//! Fan-in of two monitor channels.

use nomad_stream_core::MonitorMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Forward messages from `node` and `alloc` to `out` until both close.
///
/// Order within each source is preserved; across sources whichever
/// message arrives first goes first. An error-level message cancels
/// `cancel`, is forwarded, and ends the merge: nothing queued after it
/// is forwarded. `out` is closed (dropped) and `cancel` is cancelled on
/// every return path, so producers holding the token see the shutdown.
pub async fn multiplex(
    cancel: CancellationToken,
    out: mpsc::Sender<MonitorMessage>,
    node: mpsc::Receiver<MonitorMessage>,
    alloc: mpsc::Receiver<MonitorMessage>,
) {
    let _guard = cancel.clone().drop_guard();
    let mut node = Some(node);
    let mut alloc = Some(alloc);

    loop {
        if node.is_none() && alloc.is_none() {
            tracing::debug!("monitor sources finished");
            return;
        }

        let msg = tokio::select! {
            () = cancel.cancelled() => return,
            msg = recv(&mut node) => msg,
            msg = recv(&mut alloc) => msg,
        };
        let Some(msg) = msg else { continue };

        if msg.is_error() {
            cancel.cancel();
            // The consumer may already be gone; nothing else to do then.
            let _ = out.send(msg).await;
            return;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            sent = out.send(msg) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Receive from `source`, clearing it once it closes.
///
/// A cleared source never completes, so it drops out of the select.
async fn recv(source: &mut Option<mpsc::Receiver<MonitorMessage>>) -> Option<MonitorMessage> {
    let Some(rx) = source else {
        return std::future::pending().await;
    };
    let msg = rx.recv().await;
    if msg.is_none() {
        *source = None;
    }
    msg
}
