//! Connection actor
//!
//! Every TLS link is owned by exactly one task, which multiplexes inbound
//! cells from its reader subtask with internal circuit commands from
//! stream tasks, DNS workers, and other connections. The actor alone
//! mutates the circuit and relay-circuit maps; everything else reaches
//! them through the command queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::circuit::{Circuit, RelayCircuit};
use crate::commands::{CircuitCommand, CircuitQueue, CircuitRequest};
use crate::error::{CellError, DestroyReason, HandlerResult, TorError};
use crate::or::OrContext;
use crate::protocol::{
    Cell, CellBuf, CellCommand, CellReader, CircuitId, LinkVersion, WriteBatcher,
};
use crate::tls::{Fingerprint, LinkStream, TlsLink, TlsSessionInfo, TorTls};

pub(crate) const READ_QUEUE_LEN: usize = 100;
pub(crate) const WRITE_QUEUE_LEN: usize = 2000;
pub(crate) const CIRC_QUEUE_LEN: usize = 2000;

pub(crate) type Reader = ReadHalf<Box<dyn LinkStream>>;
type Writer = WriteHalf<Box<dyn LinkStream>>;

/// State owned by one link's actor task.
pub struct OnionConnection {
    pub(crate) or: Arc<OrContext>,
    pub(crate) tls: Arc<TorTls>,
    pub(crate) session: TlsSessionInfo,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) version: LinkVersion,
    pub(crate) is_outbound: bool,
    pub(crate) write_tx: mpsc::Sender<CellBuf>,
    pub(crate) circuit_tx: CircuitQueue,
    circuit_rx: mpsc::Receiver<CircuitCommand>,
    reader_handle: Option<JoinHandle<()>>,
    pub(crate) circuits: HashMap<CircuitId, Circuit>,
    pub(crate) relay_circuits: HashMap<CircuitId, RelayCircuit>,
    pub(crate) we_authenticated: bool,
    pub(crate) they_authenticated: bool,
    pub(crate) their_fingerprint: Option<Fingerprint>,
    pub(crate) their_fingerprint256: Option<[u8; 32]>,
}

impl OnionConnection {
    fn new(or: Arc<OrContext>, link: TlsLink, peer_addr: SocketAddr, is_outbound: bool) -> (OnionConnection, Reader) {
        let TlsLink { stream, session } = link;
        let (read_half, write_half) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_LEN);
        let (circuit_tx, circuit_rx) = mpsc::channel(CIRC_QUEUE_LEN);
        tokio::spawn(writer_task(write_rx, write_half));

        let conn = OnionConnection {
            tls: or.current_tls(),
            or,
            session,
            peer_addr,
            version: LinkVersion::V4,
            is_outbound,
            write_tx,
            circuit_tx,
            circuit_rx,
            reader_handle: None,
            circuits: HashMap::new(),
            relay_circuits: HashMap::new(),
            we_authenticated: false,
            they_authenticated: false,
            their_fingerprint: None,
            their_fingerprint256: None,
        };
        (conn, read_half)
    }

    fn spawn_reader(&mut self, read_half: Reader) -> mpsc::Receiver<Cell> {
        let (cell_tx, cell_rx) = mpsc::channel(READ_QUEUE_LEN);
        self.reader_handle = Some(tokio::spawn(reader_task(
            read_half,
            self.version,
            cell_tx,
        )));
        cell_rx
    }

    /// Drive an accepted (inbound) link to completion.
    pub async fn handle_server(or: Arc<OrContext>, link: TlsLink, peer_addr: SocketAddr) {
        let (mut conn, mut read_half) = OnionConnection::new(or, link, peer_addr, false);

        let outcome = async {
            conn.negotiate_version_server(&mut read_half).await?;
            log::debug!("negotiated version {} with {peer_addr}", conn.version.get());

            let mut cell_rx = conn.spawn_reader(read_half);
            conn.send_certs(None).await?;
            conn.we_authenticated = true;
            conn.send_auth_challenge().await?;
            conn.send_netinfo(None).await?;
            conn.server_handshake_loop(&mut cell_rx).await?;
            Ok::<_, TorError>(cell_rx)
        }
        .await;

        match outcome {
            Ok(mut cell_rx) => conn.run(&mut cell_rx).await,
            Err(err) => log::info!("handshake with {peer_addr} failed: {err}"),
        }
        conn.cleanup().await;
    }

    /// Drive a dialed (outbound) link to completion, optionally seeding it
    /// with the circuit request that prompted the dial.
    pub async fn handle_client(
        or: Arc<OrContext>,
        link: TlsLink,
        peer_addr: SocketAddr,
        request: Option<Box<CircuitRequest>>,
    ) {
        let (mut conn, mut read_half) = OnionConnection::new(or, link, peer_addr, true);

        if let Some(req) = request {
            // Processed by our own run loop once the link is up.
            let _ = conn.circuit_tx.send(CircuitCommand::Request(req)).await;
        }

        let outcome = async {
            let mut hash_in = sha2::Sha256::default();
            let mut hash_out = sha2::Sha256::default();
            conn.negotiate_version_client(&mut read_half, &mut hash_in, &mut hash_out)
                .await?;
            log::debug!("negotiated version {} with {peer_addr}", conn.version.get());

            let mut cell_rx = conn.spawn_reader(read_half);
            conn.client_handshake_loop(&mut cell_rx, &mut hash_in, &mut hash_out)
                .await?;
            Ok::<_, TorError>(cell_rx)
        }
        .await;

        match outcome {
            Ok(mut cell_rx) => {
                if conn.they_authenticated {
                    if let Some(fp) = conn.their_fingerprint {
                        if let Err(err) = conn.or.register_connection(fp, conn.circuit_tx.clone())
                        {
                            log::info!("register warning: {err}");
                        }
                    }
                }
                conn.run(&mut cell_rx).await;
            }
            Err(err) => log::info!("handshake with {peer_addr} failed: {err}"),
        }
        conn.cleanup().await;
    }

    /// Main dispatch loop; returns when the link must close.
    pub(crate) async fn run(&mut self, cell_rx: &mut mpsc::Receiver<Cell>) {
        log::debug!("handshake done, entering run loop for {}", self.peer_addr);
        loop {
            let (circ_id, result) = tokio::select! {
                cell = cell_rx.recv() => match cell {
                    Some(cell) => (cell.circ_id(), self.route_cell(cell).await),
                    None => return,
                },
                cmd = self.circuit_rx.recv() => match cmd {
                    Some(cmd) => (cmd.circ_id(), self.route_command(cmd).await),
                    None => return,
                },
            };

            if let Err(err) = result {
                if self.apply_error(circ_id, err).await {
                    return;
                }
            }
        }
    }

    /// Apply a handler error's action. Returns `true` when the connection
    /// must drop.
    async fn apply_error(&mut self, circ_id: CircuitId, err: CellError) -> bool {
        match err {
            CellError::CloseConnection(e) => {
                log::warn!("closing connection to {}: {e}", self.peer_addr);
                true
            }
            CellError::CloseCircuit(e, reason) => {
                if circ_id.is_zero() {
                    log::warn!("circuit error without a circuit, disconnecting: {e}");
                    return true;
                }
                log::info!("closing circuit {circ_id}: {e}");
                self.queue_destroy(circ_id, reason).await;
                if circ_id.initiator_bit() != self.is_outbound {
                    match self.circuits.remove(&circ_id) {
                        Some(circ) => self.destroy_circuit(circ, true, reason).await,
                        None => {
                            log::warn!("cannot close unknown circuit {circ_id}, disconnecting");
                            return true;
                        }
                    }
                } else {
                    match self.relay_circuits.remove(&circ_id) {
                        Some(circ) => self.destroy_relay_circuit(circ, true, reason).await,
                        None => {
                            log::warn!("cannot close unknown relay circuit {circ_id}, disconnecting");
                            return true;
                        }
                    }
                }
                false
            }
            CellError::RefuseCircuit(e, reason) => {
                if circ_id.is_zero() {
                    log::warn!("circuit refusal without a circuit, disconnecting: {e}");
                    return true;
                }
                log::info!("refusing circuit {circ_id}: {e}");
                self.queue_destroy(circ_id, reason).await;
                false
            }
            // Stream errors are resolved inside the relay dispatcher where
            // the stream ID is known; one surfacing here is a logic error.
            CellError::CloseStream(e, _) | CellError::RefuseStream(e, _) => {
                log::warn!("unhandled stream error, disconnecting: {e}");
                true
            }
        }
    }

    /// Dispatch an inbound cell.
    async fn route_cell(&mut self, cell: Cell) -> HandlerResult {
        let command = match cell.command() {
            Some(command) => command,
            None => {
                log::info!("got a cell with unknown command {} - dropping", cell.command_byte());
                return Ok(());
            }
        };

        match command {
            CellCommand::CreateFast => self.handle_create_fast(cell).await,

            CellCommand::Relay | CellCommand::RelayEarly => {
                let circ_id = cell.circ_id();
                if let Some(mut circ) = self.circuits.remove(&circ_id) {
                    let res = self.handle_relay_forward(&mut circ, &cell).await;
                    self.circuits.insert(circ_id, circ);
                    return res;
                }
                if let Some(rcirc) = self.relay_circuits.get(&circ_id) {
                    if command == CellCommand::RelayEarly {
                        return Err(CellError::close_connection(TorError::Protocol(
                            "refusing to route a RELAY_EARLY cell back".into(),
                        )));
                    }
                    let (queue, their_id) = (rcirc.previous_hop.clone(), rcirc.their_id);
                    return self.handle_relay_backward(queue, their_id, &cell).await;
                }
                log::info!("received a relay cell for unknown circuit {circ_id} - dropping");
                Ok(())
            }

            CellCommand::Create | CellCommand::Create2 => {
                self.handle_create(cell, command == CellCommand::Create2).await
            }

            CellCommand::Destroy => self.handle_destroy(cell).await,

            CellCommand::Created | CellCommand::Created2 => {
                self.handle_created(cell, command == CellCommand::Created2).await
            }

            CellCommand::Padding | CellCommand::Vpadding => Ok(()),

            CellCommand::Certs
            | CellCommand::Netinfo
            | CellCommand::AuthChallenge
            | CellCommand::Authorize
            | CellCommand::Authenticate => Err(CellError::close_connection(TorError::Protocol(
                format!("command {command:?} not allowed after the handshake"),
            ))),

            _ => {
                log::info!("dropping unexpected {command:?} cell");
                Ok(())
            }
        }
    }

    /// Dispatch an internal circuit command.
    async fn route_command(&mut self, cmd: CircuitCommand) -> HandlerResult {
        match cmd {
            CircuitCommand::Request(req) => self.handle_circuit_request(req).await,

            CircuitCommand::RelayData {
                id,
                data,
                for_relay: false,
                ..
            } => {
                let Some(mut circ) = self.circuits.remove(&id) else {
                    log::info!("internal command for nonexistent circuit {id}");
                    return Ok(());
                };
                let res = self.relay_data_backward(&mut circ, data).await;
                self.circuits.insert(id, circ);
                res
            }

            CircuitCommand::RelayData {
                id,
                data,
                for_relay: true,
                command,
            } => {
                let Some(rcirc) = self.relay_circuits.get(&id) else {
                    log::info!("internal command for nonexistent relay circuit {id}");
                    return Ok(());
                };
                let cell = Cell::new(self.version, rcirc.id, command, &data);
                self.queue_cell(cell).await;
                Ok(())
            }

            CircuitCommand::Destroyed {
                id,
                reason,
                for_relay: false,
            } => {
                if let Some(circ) = self.circuits.remove(&id) {
                    log::debug!("circuit {id} destroyed by neighbor");
                    self.destroy_circuit(circ, false, reason).await;
                    self.queue_destroy(id, reason).await;
                } else {
                    log::info!("internal destroy for nonexistent circuit {id}");
                }
                Ok(())
            }

            CircuitCommand::Destroyed {
                id,
                reason,
                for_relay: true,
            } => {
                if let Some(rcirc) = self.relay_circuits.remove(&id) {
                    log::debug!("relay circuit {id} destroyed by neighbor");
                    self.destroy_relay_circuit(rcirc, false, reason).await;
                    self.queue_destroy(id, reason).await;
                } else {
                    log::info!("internal destroy for nonexistent relay circuit {id}");
                }
                Ok(())
            }

            CircuitCommand::Created {
                id,
                handshake,
                new_handshake,
            } => {
                let Some(mut circ) = self.circuits.remove(&id) else {
                    log::info!("internal command for nonexistent circuit {id}");
                    return Ok(());
                };
                let res = self
                    .handle_circuit_created(&mut circ, handshake, new_handshake)
                    .await;
                self.circuits.insert(id, circ);
                res
            }

            CircuitCommand::Stream {
                id,
                stream,
                event,
                reason,
                remote_addr,
            } => {
                let Some(mut circ) = self.circuits.remove(&id) else {
                    log::info!("internal command for nonexistent circuit {id}");
                    return Ok(());
                };
                let res = self
                    .handle_stream_event(&mut circ, stream, event, reason, remote_addr)
                    .await;
                self.circuits.insert(id, circ);
                res
            }

            CircuitCommand::StreamBytes { id, stream, data } => {
                let Some(mut circ) = self.circuits.remove(&id) else {
                    log::info!("internal command for nonexistent circuit {id}");
                    return Ok(());
                };
                let res = self.handle_stream_bytes(&mut circ, stream, data).await;
                self.circuits.insert(id, circ);
                res
            }

            CircuitCommand::Resolved {
                id,
                stream,
                answers,
            } => {
                let Some(mut circ) = self.circuits.remove(&id) else {
                    log::info!("internal command for nonexistent circuit {id}");
                    return Ok(());
                };
                let res = self.handle_resolved(&mut circ, stream, answers).await;
                self.circuits.insert(id, circ);
                res
            }
        }
    }

    /// Handle an inbound DESTROY cell.
    async fn handle_destroy(&mut self, cell: Cell) -> HandlerResult {
        let reason = DestroyReason::from_u8(cell.payload()[0]);
        let circ_id = cell.circ_id();
        log::debug!("got a destroy for circuit {circ_id} with reason {reason:?}");

        if circ_id.initiator_bit() != self.is_outbound {
            match self.circuits.remove(&circ_id) {
                Some(circ) => self.destroy_circuit(circ, true, reason).await,
                None => log::info!("DESTROY for unknown circuit {circ_id} - ignoring"),
            }
            return Ok(());
        }

        match self.relay_circuits.remove(&circ_id) {
            Some(rcirc) => self.destroy_relay_circuit(rcirc, true, reason).await,
            None => log::info!("DESTROY for unknown circuit {circ_id} - ignoring"),
        }
        Ok(())
    }

    /// Tear down a terminating circuit: abort its window, destroy its
    /// streams, cancel or inherit an in-flight extension, and optionally
    /// announce the destruction to the next hop.
    pub(crate) async fn destroy_circuit(
        &mut self,
        mut circ: Circuit,
        announce: bool,
        reason: DestroyReason,
    ) {
        circ.backward_window.abort();
        for (_, stream) in circ.streams.drain() {
            stream.destroy();
        }

        if let Some(extend) = circ.extend_state.take() {
            if let Some(next_hop) = extend.abort() {
                debug_assert!(circ.next_hop.is_none());
                circ.next_hop = Some(next_hop);
            }
        }

        if announce {
            if let Some((queue, next_id)) = circ.next_hop.take() {
                let _ = queue
                    .send(CircuitCommand::Destroyed {
                        id: next_id,
                        reason,
                        for_relay: true,
                    })
                    .await;
            }
        }
    }

    pub(crate) async fn destroy_relay_circuit(
        &mut self,
        circ: RelayCircuit,
        announce: bool,
        reason: DestroyReason,
    ) {
        if announce {
            let _ = circ
                .previous_hop
                .send(CircuitCommand::Destroyed {
                    id: circ.their_id,
                    reason,
                    for_relay: false,
                })
                .await;
        }
    }

    /// Queue a cell for the writer. A failed send means the writer is
    /// gone and the connection is on its way down.
    pub(crate) async fn queue_cell(&self, cell: Cell) {
        let _ = self.write_tx.send(cell.into_buf()).await;
    }

    pub(crate) async fn queue_destroy(&self, id: CircuitId, reason: DestroyReason) {
        let cell = Cell::new(self.version, id, CellCommand::Destroy, &[reason as u8]);
        self.queue_cell(cell).await;
    }

    /// Pick a circuit ID that collides with nothing on this link.
    pub(crate) fn new_circ_id(&self) -> CircuitId {
        loop {
            let id = crate::circuit::random_circ_id(self.is_outbound, self.version);
            if !self.circuits.contains_key(&id) && !self.relay_circuits.contains_key(&id) {
                return id;
            }
        }
    }

    /// Final teardown. Synthesizes destruction for every owned circuit and
    /// answers any still-queued circuit requests.
    async fn cleanup(mut self) {
        if self.they_authenticated {
            if let Some(fp) = self.their_fingerprint {
                self.or.end_connection(&fp, &self.circuit_tx);
            }
        }

        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }

        let relay_circuits: Vec<RelayCircuit> =
            self.relay_circuits.drain().map(|(_, c)| c).collect();
        for circ in relay_circuits {
            self.destroy_relay_circuit(circ, true, DestroyReason::OrConnClosed)
                .await;
        }

        let circuits: Vec<Circuit> = self.circuits.drain().map(|(_, c)| c).collect();
        for circ in circuits {
            self.destroy_circuit(circ, true, DestroyReason::OrConnClosed)
                .await;
        }

        // After deregistration no new CircuitRequest can arrive; whatever
        // is still queued gets a synthesized destroy.
        while let Ok(cmd) = self.circuit_rx.try_recv() {
            if let CircuitCommand::Request(req) = cmd {
                let _ = req.success_queue.try_send(CircuitCommand::Destroyed {
                    id: req.local_id,
                    reason: DestroyReason::OrConnClosed,
                    for_relay: false,
                });
            }
        }
        log::debug!("connection to {} cleaned up", self.peer_addr);
    }
}

/// Reader subtask: network bytes in, framed cells out.
async fn reader_task(mut read_half: Reader, version: LinkVersion, cell_tx: mpsc::Sender<Cell>) {
    let mut reader = CellReader::new(version);
    loop {
        match read_half.read(reader.space()).await {
            Ok(0) | Err(_) => return,
            Ok(n) => reader.advance(n),
        }
        loop {
            match reader.next_cell() {
                Ok(Some(cell)) => {
                    if cell_tx.send(cell).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log::info!("dropping connection: {err}");
                    return;
                }
            }
        }
    }
}

/// Writer subtask: batches queued cells into TLS-record-sized writes.
async fn writer_task(mut write_rx: mpsc::Receiver<CellBuf>, mut write_half: Writer) {
    let mut batch = WriteBatcher::new();
    while let Some(first) = write_rx.recv().await {
        batch.clear();
        if !batch.push(&first) {
            if write_half.write_all(&first).await.is_err() {
                return;
            }
            continue;
        }
        drop(first);

        let mut carry = None;
        while batch.has_room_for_cell() {
            match write_rx.try_recv() {
                Ok(item) => {
                    if !batch.push(&item) {
                        carry = Some(item);
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        if write_half.write_all(batch.bytes()).await.is_err() {
            return;
        }
        if let Some(item) = carry {
            if write_half.write_all(&item).await.is_err() {
                return;
            }
        }
    }
    let _ = write_half.shutdown().await;
}
