//! Exit streams
//!
//! RELAY_BEGIN turns into a TCP connection proxied over the circuit. Each
//! stream runs two tasks: a socket reader gated on the flow-control
//! windows, and a control loop that pumps the write channel and watches
//! for the destruction signal (the channel closing).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::circuit::{Circuit, StreamHandle};
use crate::commands::{CircuitCommand, CircuitQueue, StreamEvent};
use crate::connection::OnionConnection;
use crate::dns;
use crate::error::{CellError, DestroyReason, HandlerResult, StreamEndReason, TorError};
use crate::exitpolicy::ExitPolicy;
use crate::protocol::{CellBuf, CircuitId, RelayCellView, Window, MAX_RELAY_LEN};

/// Initial stream-level flow control window.
const STREAM_WINDOW: i64 = 500;

/// Window level at which a stream SENDME refills the client's credit.
const STREAM_SENDME_LEVEL: i64 = 450;

/// Depth of the actor-to-stream write channel; sized just past the window
/// so honest clients can never fill it.
const WRITE_CHANNEL_LEN: usize = 505;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

fn target_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let ip = r"(?:(?:[0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}(?:[0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])";
        let ipv6 = r"\[[0-9a-fA-F:]{3,45}\]";
        let host = r"(?:(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*(?:[A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])";
        Regex::new(&format!("^({ip}|{ipv6}|{host}):([1-9][0-9]{{0,4}})$"))
            .expect("stream target regex compiles")
    })
}

#[derive(Debug)]
pub(crate) enum TargetError {
    /// The string does not fit the address:port grammar at all.
    Invalid,
    /// Grammatically fine, but the port exceeds 65535.
    PortRange,
}

/// Validate an `addr:port` stream target.
pub(crate) fn parse_stream_target(target: &str) -> Result<(String, u16), TargetError> {
    let caps = target_regex()
        .captures(target)
        .ok_or(TargetError::Invalid)?;
    let port: u32 = caps[2].parse().expect("regex admits digits only");
    let port = u16::try_from(port).map_err(|_| TargetError::PortRange)?;
    Ok((caps[1].to_string(), port))
}

impl OnionConnection {
    /// RELAY_BEGIN / RELAY_BEGIN_DIR: validate the target, consult the
    /// exit policy later in the stream task, and launch the proxy tasks.
    pub(crate) fn handle_relay_begin(
        &self,
        circ: &mut Circuit,
        rcell: &RelayCellView<'_>,
        is_dir: bool,
    ) -> HandlerResult {
        let stream_id = rcell.stream_id();
        if circ.streams.contains_key(&stream_id) {
            return Err(CellError::close_circuit(
                TorError::Protocol("we already have a stream with that ID".into()),
                DestroyReason::Protocol,
            ));
        }

        if is_dir && self.or.config.dir_port == 0 {
            return Err(CellError::refuse_stream(
                TorError::Stream("we're no directory".into()),
                StreamEndReason::NotDirectory,
            ));
        }

        let target = if is_dir {
            format!("127.0.0.1:{}", self.or.config.dir_port)
        } else {
            let data = rcell.data();
            let addr_len = data.iter().position(|&b| b == 0).unwrap_or(0);
            if addr_len == 0 {
                return Err(CellError::refuse_stream(
                    TorError::Stream("no address found".into()),
                    StreamEndReason::TorProtocol,
                ));
            }
            String::from_utf8_lossy(&data[..addr_len]).into_owned()
        };

        let (host, port) = match parse_stream_target(&target) {
            Ok(parsed) => parsed,
            Err(TargetError::Invalid) => {
                return Err(CellError::refuse_stream(
                    TorError::Stream(format!(
                        "refusing to connect to {target:?} as it does not look valid"
                    )),
                    StreamEndReason::TorProtocol,
                ))
            }
            Err(TargetError::PortRange) => {
                return Err(CellError::close_stream(
                    TorError::Stream("invalid port in RELAY_BEGIN".into()),
                    StreamEndReason::TorProtocol,
                ))
            }
        };

        log::debug!("opening stream {stream_id} to {target}");
        let (handle, runner) = launch_stream(stream_id);
        let backward_window = Arc::clone(&circ.backward_window);
        let queue = self.circuit_tx.clone();
        let policy = self.or.config.exit_policy.clone();
        let circ_id = circ.id;
        circ.streams.insert(stream_id, handle);
        tokio::spawn(runner.run(circ_id, backward_window, queue, host, port, is_dir, policy));
        Ok(())
    }
}

/// Build the actor-side handle and the task-side runner for one stream.
fn launch_stream(stream_id: u16) -> (StreamHandle, StreamRunner) {
    let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_LEN);
    let forward_window = Arc::new(Window::new(STREAM_WINDOW));
    let backward_window = Arc::new(Window::new(STREAM_WINDOW));
    let finished = Arc::new(AtomicBool::new(false));

    let handle = StreamHandle {
        write_tx,
        forward_window: Arc::clone(&forward_window),
        backward_window: Arc::clone(&backward_window),
        finished: Arc::clone(&finished),
    };
    let runner = StreamRunner {
        stream_id,
        write_rx,
        forward_window,
        backward_window,
        finished,
    };
    (handle, runner)
}

struct StreamRunner {
    stream_id: u16,
    write_rx: mpsc::Receiver<CellBuf>,
    forward_window: Arc<Window>,
    backward_window: Arc<Window>,
    finished: Arc<AtomicBool>,
}

impl StreamRunner {
    async fn run(
        mut self,
        circ_id: CircuitId,
        circ_window: Arc<Window>,
        queue: CircuitQueue,
        host: String,
        port: u16,
        is_dir: bool,
        policy: ExitPolicy,
    ) {
        let stream_id = self.stream_id;
        let send_event = |event, reason, remote_addr: Option<Vec<u8>>| {
            let queue = queue.clone();
            async move {
                let _ = queue
                    .send(CircuitCommand::Stream {
                        id: circ_id,
                        stream: stream_id,
                        event,
                        reason,
                        remote_addr,
                    })
                    .await;
            }
        };

        let answers = dns::resolve(&host).await;
        let Some(addr) = answers.first().filter(|a| a.is_address()) else {
            send_event(
                StreamEvent::Disconnected,
                StreamEndReason::ResolveFailed,
                None,
            )
            .await;
            return;
        };
        let ip = addr.to_ip().expect("address answers carry an address");

        if !is_dir && !policy.allows_connect(&addr.value, port) {
            send_event(
                StreamEvent::Disconnected,
                StreamEndReason::ExitPolicy,
                Some(addr.value.clone()),
            )
            .await;
            return;
        }

        let socket =
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((ip, port))).await {
                Ok(Ok(socket)) => socket,
                _ => {
                    send_event(
                        StreamEvent::Disconnected,
                        StreamEndReason::ConnectRefused,
                        None,
                    )
                    .await;
                    return;
                }
            };

        send_event(StreamEvent::Connected, StreamEndReason::Misc, Some(addr.value.clone())).await;

        let (read_half, mut write_half) = socket.into_split();
        let (read_tx, mut read_rx) = mpsc::channel::<CellBuf>(5);
        tokio::spawn(socket_reader(
            read_half,
            Arc::clone(&self.backward_window),
            Arc::clone(&circ_window),
            Arc::clone(&self.finished),
            read_tx,
        ));

        loop {
            tokio::select! {
                item = self.write_rx.recv() => {
                    let Some(data) = item else { break };
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                    drop(data);
                    // Drain whatever queued up before handing out credit.
                    let mut dead = false;
                    while let Ok(data) = self.write_rx.try_recv() {
                        if write_half.write_all(&data).await.is_err() {
                            dead = true;
                            break;
                        }
                    }
                    if dead {
                        break;
                    }
                    while self.forward_window.level() <= STREAM_SENDME_LEVEL {
                        self.forward_window.refill(50);
                        send_event(StreamEvent::Sendme, StreamEndReason::Misc, None).await;
                    }
                }
                item = read_rx.recv() => {
                    let Some(data) = item else { break };
                    let _ = queue
                        .send(CircuitCommand::StreamBytes {
                            id: circ_id,
                            stream: self.stream_id,
                            data,
                        })
                        .await;
                }
            }
        }

        // Single teardown path regardless of who failed first: close the
        // socket, stop the reader, release every waiter.
        drop(write_half);
        self.finished.store(true, Ordering::SeqCst);
        self.backward_window.abort();
        self.forward_window.abort();
        circ_window.abort();
        send_event(StreamEvent::Disconnected, StreamEndReason::Done, None).await;
        log::debug!("disconnected stream {} to {host}", self.stream_id);
    }
}

/// Socket-to-circuit pump: acquire stream and circuit credit, read, chunk
/// into relay-sized pieces.
async fn socket_reader(
    mut read_half: OwnedReadHalf,
    backward_window: Arc<Window>,
    circ_window: Arc<Window>,
    finished: Arc<AtomicBool>,
    read_tx: mpsc::Sender<CellBuf>,
) {
    let mut buf = [0u8; 4096];
    loop {
        if finished.load(Ordering::SeqCst) {
            return;
        }
        if !backward_window.take().await {
            return;
        }
        if !circ_window.take().await {
            return;
        }
        if finished.load(Ordering::SeqCst) {
            return;
        }

        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        for chunk in buf[..n].chunks(MAX_RELAY_LEN) {
            if read_tx.send(CellBuf::copy_from(chunk)).await.is_err() {
                return;
            }
        }
    }
}
