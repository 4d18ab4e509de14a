//! Interactive exec session over a connected WebSocket.

use std::{sync::Arc, time::Duration};

use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use nomad_stream_client::Client;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Mutex, mpsc, watch},
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Message, protocol::frame::coding::CloseCode},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    connect::{DEFAULT_DIRECT_CONNECT_TIMEOUT, ExecRequest, TungsteniteDialer, dial_exec},
    error::ExecError,
    protocol::{ExecInput, ExecOutput, TerminalSize},
};

/// Size of the buffer stdin is read into; each read becomes one frame.
pub const STDIN_BUFFER_SIZE: usize = 2048;

/// Default interval between keep-alive frames.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Exec session tuning.
///
/// A zero `heartbeat_interval` disables keep-alive frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    #[serde(with = "nomad_stream_core::encoding::duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "nomad_stream_core::encoding::duration_ms")]
    pub direct_connect_timeout: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            direct_connect_timeout: DEFAULT_DIRECT_CONNECT_TIMEOUT,
        }
    }
}

/// Lifecycle of an exec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Streaming,
    Exited(i32),
    Errored,
}

impl SessionState {
    /// Whether no further transitions can happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exited(_) | Self::Errored)
    }
}

/// Local ends of the remote process's standard streams.
pub struct ExecIo {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
    /// Terminal size changes to forward, if the session has a tty.
    pub resize: Option<mpsc::Receiver<TerminalSize>>,
}

impl ExecIo {
    pub fn new(
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            resize: None,
        }
    }

    #[must_use]
    pub fn with_resize(mut self, resize: mpsc::Receiver<TerminalSize>) -> Self {
        self.resize = Some(resize);
        self
    }
}

/// One run of a command inside an allocation.
pub struct ExecSession {
    id: Uuid,
    options: ExecOptions,
    state: watch::Sender<SessionState>,
}

impl ExecSession {
    #[must_use]
    pub fn new(options: ExecOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id: Uuid::new_v4(),
            options,
            state,
        }
    }

    /// Session identifier used in log spans.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Connect to the allocation and run the command to completion.
    ///
    /// Tries the node running the allocation directly, then the servers.
    /// The node is looked up unless `request.node_address` is set.
    ///
    /// # Errors
    /// Returns error if the connection cannot be established or the
    /// session fails; see [`ExecSession::run`].
    pub async fn start(
        &self,
        client: &Client,
        request: &ExecRequest,
        io: ExecIo,
        cancel: CancellationToken,
    ) -> Result<i32, ExecError> {
        let span = tracing::info_span!("exec", session_id = %self.id, alloc_id = %request.alloc_id);
        let socket = async {
            let dialer = TungsteniteDialer::for_client(client, &request.query)?;
            dial_exec(client, request, &dialer, self.options.direct_connect_timeout).await
        }
        .instrument(span)
        .await;

        match socket {
            Ok(socket) => self.run(socket, io, cancel).await,
            Err(err) => {
                self.set_state(SessionState::Errored);
                Err(err)
            }
        }
    }

    /// Drive a connected session until the remote process exits.
    ///
    /// Returns the remote exit code. Every failure maps to exit code
    /// [`ExecError::exit_code`].
    ///
    /// # Errors
    /// Returns error if `cancel` fires, reading stdin fails, writing
    /// output fails, or the connection ends before an exit frame.
    pub async fn run<S>(
        &self,
        socket: WebSocketStream<S>,
        io: ExecIo,
        cancel: CancellationToken,
    ) -> Result<i32, ExecError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let span = tracing::info_span!("exec", session_id = %self.id);
        let result = self.drive(socket, io, cancel).instrument(span).await;
        match &result {
            Ok(code) => {
                tracing::info!(session_id = %self.id, exit_code = code, "exec session finished");
                self.set_state(SessionState::Exited(*code));
            }
            Err(err) => {
                tracing::debug!(session_id = %self.id, error = %err, "exec session failed");
                self.set_state(SessionState::Errored);
            }
        }
        result
    }

    async fn drive<S>(
        &self,
        socket: WebSocketStream<S>,
        io: ExecIo,
        cancel: CancellationToken,
    ) -> Result<i32, ExecError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.set_state(SessionState::Streaming);

        let child = cancel.child_token();
        let (sink, stream) = socket.split();
        let sender = FrameSender::new(sink, child.clone());
        let (input_err_tx, mut input_err_rx) = mpsc::channel(1);

        let mut tasks = JoinSet::new();
        tasks.spawn(relay_stdin(io.stdin, sender.clone(), input_err_tx).in_current_span());
        if let Some(resize) = io.resize {
            tasks.spawn(relay_resize(resize, sender.clone()).in_current_span());
        }
        let period = self.options.heartbeat_interval;
        if !period.is_zero() {
            tasks.spawn(send_heartbeats(sender.clone(), period).in_current_span());
        }

        let receive = receive(stream, io.stdout, io.stderr);
        tokio::pin!(receive);

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ExecError::Cancelled),
            result = &mut receive => result,
            Some(err) = input_err_rx.recv() => Err(ExecError::Input(err)),
        };

        child.cancel();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                _ => {}
            }
        }
        sender.close().await;
        result
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }
}

type FrameSink<S> = SplitSink<WebSocketStream<S>, Message>;

/// Serialized access to the write half shared by the send tasks.
struct FrameSender<S> {
    sink: Arc<Mutex<FrameSink<S>>>,
    cancel: CancellationToken,
}

impl<S> Clone for FrameSender<S> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S> FrameSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(sink: FrameSink<S>, cancel: CancellationToken) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            cancel,
        }
    }

    async fn send_json(&self, input: &ExecInput) -> Result<(), ExecError> {
        let json = serde_json::to_string(input)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Send `input` unless the session is shutting down.
    ///
    /// Write failures are logged and otherwise ignored. Returns `false`
    /// once the session is cancelled.
    async fn send(&self, input: &ExecInput) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.send_json(input) => {
                if let Err(e) = sent {
                    tracing::debug!(error = %e, "failed to send exec frame");
                }
                true
            }
        }
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "failed to close exec websocket"),
            Err(_) => tracing::debug!("timed out closing exec websocket"),
        }
    }
}

async fn relay_stdin<S>(
    mut stdin: Box<dyn AsyncRead + Send + Unpin>,
    sender: FrameSender<S>,
    errors: mpsc::Sender<std::io::Error>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; STDIN_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            biased;
            () = sender.cancel.cancelled() => return,
            read = stdin.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                sender.send(&ExecInput::StdinClose).await;
                return;
            }
            Ok(n) => {
                if !sender.send(&ExecInput::Stdin(buf[..n].to_vec())).await {
                    return;
                }
            }
            Err(e) => {
                let _ = errors.try_send(e);
                return;
            }
        }
    }
}

async fn relay_resize<S>(mut resize: mpsc::Receiver<TerminalSize>, sender: FrameSender<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let size = tokio::select! {
            biased;
            () = sender.cancel.cancelled() => return,
            size = resize.recv() => size,
        };
        let Some(size) = size else { return };
        if !sender.send(&ExecInput::TtyResize(size)).await {
            return;
        }
    }
}

async fn send_heartbeats<S>(sender: FrameSender<S>, period: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = sender.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        tracing::trace!("sending exec heartbeat");
        if !sender.send(&ExecInput::Heartbeat).await {
            return;
        }
    }
}

async fn receive<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    mut stdout: Box<dyn AsyncWrite + Send + Unpin>,
    mut stderr: Box<dyn AsyncWrite + Send + Unpin>,
) -> Result<i32, ExecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = stream.next().await {
        let output: ExecOutput = match message? {
            Message::Text(text) => serde_json::from_str(text.as_str())?,
            Message::Binary(data) => serde_json::from_slice(&data)?,
            Message::Close(frame) => {
                return Err(match frame {
                    Some(frame) if frame.code != CloseCode::Normal => ExecError::Closed {
                        code: frame.code.into(),
                        reason: frame.reason.as_str().to_string(),
                    },
                    _ => ExecError::ClosedBeforeExit,
                });
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        match output {
            ExecOutput::Stdout(data) if !data.is_empty() => write_output(&mut stdout, &data).await?,
            ExecOutput::Stderr(data) if !data.is_empty() => write_output(&mut stderr, &data).await?,
            ExecOutput::Exited(code) => return Ok(code),
            _ => {}
        }
    }
    Err(ExecError::ClosedBeforeExit)
}

async fn write_output(
    out: &mut Box<dyn AsyncWrite + Send + Unpin>,
    data: &[u8],
) -> Result<(), ExecError> {
    out.write_all(data).await.map_err(ExecError::Output)?;
    out.flush().await.map_err(ExecError::Output)
}
