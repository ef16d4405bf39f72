//! Relay cell dispatcher
//!
//! Inbound RELAY/RELAY_EARLY cells are decrypted one layer and subjected
//! to the recognized test: a zero recognized field plus a digest match
//! against the forward rolling SHA-1. Recognized cells are handled here;
//! everything else is forwarded opaquely to the next hop. The rolling
//! digest is checkpointed around the test so failed checks leave no trace.

use ctr::cipher::StreamCipher;

use crate::circuit::Circuit;
use crate::commands::{CircuitCommand, CircuitQueue, StreamEvent};
use crate::connection::OnionConnection;
use crate::dns::DnsAddress;
use crate::error::{CellError, DestroyReason, HandlerResult, StreamEndReason, TorError};
use crate::protocol::{
    Cell, CellBuf, CellCommand, CircuitId, RelayCellView, RelayCommand, MAX_RELAY_LEN,
    RELAY_HEADER_LEN,
};

/// Which directional state a locally built relay cell uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    #[allow(dead_code)]
    Forward,
    Backward,
}

/// TTL advertised in RELAY_CONNECTED and RELAY_END address payloads.
const CONNECTED_TTL: u32 = 300;

impl OnionConnection {
    /// An inbound RELAY cell on a circuit we terminate: peel one layer,
    /// test recognition, then handle locally or pass along.
    pub(crate) async fn handle_relay_forward(
        &self,
        circ: &mut Circuit,
        cell: &Cell,
    ) -> HandlerResult {
        let mut decrypted = CellBuf::get(false);
        decrypted.truncate(cell.payload().len());
        circ.forward
            .cipher
            .apply_keystream_b2b(cell.payload(), &mut decrypted)
            .map_err(|_| {
                CellError::close_circuit(
                    TorError::Internal("relay decrypt failed".into()),
                    DestroyReason::Internal,
                )
            })?;

        if !recognize(&mut circ.forward, &decrypted) {
            let Some((queue, next_id)) = &circ.next_hop else {
                return Err(CellError::close_circuit(
                    TorError::Protocol("cannot forward that".into()),
                    DestroyReason::Protocol,
                ));
            };
            let _ = queue
                .send(CircuitCommand::RelayData {
                    id: *next_id,
                    data: decrypted,
                    for_relay: true,
                    command: cell.command().expect("relay command checked by router"),
                })
                .await;
            return Ok(());
        }

        if RelayCellView::new(&decrypted).length() + RELAY_HEADER_LEN > decrypted.len() {
            return Err(CellError::close_circuit(
                TorError::MalformedCell("malformed relay cell".into()),
                DestroyReason::Protocol,
            ));
        }

        let cell_command = cell.command().expect("relay command checked by router");
        self.handle_relay_decrypted(circ, cell_command, decrypted).await
    }

    /// A recognized relay cell addressed to this hop.
    async fn handle_relay_decrypted(
        &self,
        circ: &mut Circuit,
        cell_command: CellCommand,
        decrypted: CellBuf,
    ) -> HandlerResult {
        let rcell = RelayCellView::new(&decrypted);
        let stream_id = rcell.stream_id();

        let result = match rcell.command() {
            Some(RelayCommand::Data) => self.handle_relay_data(circ, &rcell).await,
            Some(RelayCommand::End) => self.handle_relay_end(circ, &rcell),
            Some(RelayCommand::Sendme) => self.handle_relay_sendme(circ, &rcell),
            Some(RelayCommand::Begin) => self.handle_relay_begin(circ, &rcell, false),
            Some(RelayCommand::BeginDir) => self.handle_relay_begin(circ, &rcell, true),
            Some(RelayCommand::Extend) => {
                if cell_command == CellCommand::Relay {
                    Err(CellError::close_circuit(
                        TorError::Protocol("RELAY may not carry an EXTEND command".into()),
                        DestroyReason::Protocol,
                    ))
                } else {
                    self.handle_relay_extend(circ, &rcell).await
                }
            }
            Some(RelayCommand::Extend2) => {
                if cell_command == CellCommand::Relay {
                    Err(CellError::close_circuit(
                        TorError::Protocol("RELAY may not carry an EXTEND command".into()),
                        DestroyReason::Protocol,
                    ))
                } else {
                    self.handle_relay_extend2(circ, &rcell).await
                }
            }
            Some(RelayCommand::Truncate) => self.handle_relay_truncate(circ).await,
            Some(RelayCommand::Resolve) => self.handle_relay_resolve(circ, &rcell),
            Some(RelayCommand::Drop) => Ok(()),
            other => Err(CellError::close_circuit(
                TorError::Protocol(format!("unknown relay command {other:?}")),
                DestroyReason::Protocol,
            )),
        };

        // Stream-level failures resolve here, where the stream ID is at
        // hand: answer with RELAY_END and, for Close, drop local state.
        match result {
            Err(CellError::CloseStream(err, reason)) => {
                if stream_id == 0 {
                    return Err(CellError::close_connection(TorError::Protocol(format!(
                        "stream error without a stream: {err}"
                    ))));
                }
                log::info!("closing stream {stream_id}: {err}");
                match circ.streams.remove(&stream_id) {
                    Some(stream) => stream.destroy(),
                    None => {
                        return Err(CellError::close_circuit(
                            TorError::Protocol(format!(
                                "close for unknown stream: {err}"
                            )),
                            DestroyReason::Protocol,
                        ))
                    }
                }
                self.send_relay_cell(
                    circ,
                    stream_id,
                    Direction::Backward,
                    RelayCommand::End,
                    &[reason as u8],
                )
                .await
            }
            Err(CellError::RefuseStream(err, reason)) => {
                if stream_id == 0 {
                    return Err(CellError::close_connection(TorError::Protocol(format!(
                        "stream error without a stream: {err}"
                    ))));
                }
                log::info!("refusing stream {stream_id}: {err}");
                self.send_relay_cell(
                    circ,
                    stream_id,
                    Direction::Backward,
                    RelayCommand::End,
                    &[reason as u8],
                )
                .await
            }
            other => other,
        }
    }

    /// An inbound RELAY cell on a relay-through circuit, headed backward:
    /// pass the bytes to the previous hop untouched.
    pub(crate) async fn handle_relay_backward(
        &self,
        queue: CircuitQueue,
        their_id: CircuitId,
        cell: &Cell,
    ) -> HandlerResult {
        let _ = queue
            .send(CircuitCommand::RelayData {
                id: their_id,
                data: CellBuf::copy_from(cell.payload()),
                for_relay: false,
                command: CellCommand::Relay,
            })
            .await;
        Ok(())
    }

    /// Backward relay bytes from the next hop: add our layer and emit.
    pub(crate) async fn relay_data_backward(
        &self,
        circ: &mut Circuit,
        data: CellBuf,
    ) -> HandlerResult {
        let mut cell = Cell::new(self.version, circ.id, CellCommand::Relay, &[]);
        circ.backward
            .cipher
            .apply_keystream_b2b(&data, cell.payload_mut())
            .map_err(|_| {
                CellError::close_circuit(
                    TorError::Internal("relay encrypt failed".into()),
                    DestroyReason::Internal,
                )
            })?;
        self.queue_cell(cell).await;
        Ok(())
    }

    /// Build, digest, encrypt, and queue a relay cell of our own.
    pub(crate) async fn send_relay_cell(
        &self,
        circ: &mut Circuit,
        stream_id: u16,
        direction: Direction,
        command: RelayCommand,
        data: &[u8],
    ) -> HandlerResult {
        debug_assert!(data.len() <= MAX_RELAY_LEN);
        let mut cell = Cell::new(self.version, circ.id, CellCommand::Relay, &[]);
        let body = cell.payload_mut();
        body[0] = command as u8;
        body[3..5].copy_from_slice(&stream_id.to_be_bytes());
        body[9..11].copy_from_slice(&(data.len() as u16).to_be_bytes());
        body[RELAY_HEADER_LEN..RELAY_HEADER_LEN + data.len()].copy_from_slice(data);

        let state = match direction {
            Direction::Forward => &mut circ.forward,
            Direction::Backward => &mut circ.backward,
        };
        sha1::Digest::update(&mut state.digest, &body[..]);
        let sum = sha1::Digest::finalize(state.digest.clone());
        body[5..9].copy_from_slice(&sum[..4]);
        state.cipher.apply_keystream(body);

        self.queue_cell(cell).await;
        Ok(())
    }

    async fn handle_relay_data(
        &self,
        circ: &mut Circuit,
        rcell: &RelayCellView<'_>,
    ) -> HandlerResult {
        circ.forward_window -= 1;
        if circ.forward_window <= 900 {
            self.send_relay_cell(circ, 0, Direction::Backward, RelayCommand::Sendme, &[])
                .await?;
            circ.forward_window += 100;
        }

        let Some(stream) = circ.streams.get(&rcell.stream_id()) else {
            log::info!("ignoring data for a stream we don't know");
            return Ok(());
        };
        if !stream.forward_window.try_take() {
            return Err(CellError::close_stream(
                TorError::Stream("refusing to overflow window".into()),
                StreamEndReason::TorProtocol,
            ));
        }

        match stream.write_tx.try_send(CellBuf::copy_from(rcell.data())) {
            Ok(()) => Ok(()),
            // A closed channel means the stream is mid-teardown; its
            // disconnect event will clean up.
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => Ok(()),
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => Err(CellError::close_stream(
                TorError::Stream("stream write queue overflow".into()),
                StreamEndReason::TorProtocol,
            )),
        }
    }

    fn handle_relay_end(&self, circ: &mut Circuit, rcell: &RelayCellView<'_>) -> HandlerResult {
        match circ.streams.remove(&rcell.stream_id()) {
            Some(stream) => stream.destroy(),
            None => log::info!("ignoring RELAY_END for nonexistent stream"),
        }
        Ok(())
    }

    fn handle_relay_sendme(&self, circ: &mut Circuit, rcell: &RelayCellView<'_>) -> HandlerResult {
        if rcell.stream_id() == 0 {
            circ.backward_window.refill(100);
        } else {
            match circ.streams.get(&rcell.stream_id()) {
                Some(stream) => stream.backward_window.refill(50),
                None => log::debug!("ignoring SENDME for unknown stream"),
            }
        }
        Ok(())
    }

    fn handle_relay_resolve(&self, circ: &mut Circuit, rcell: &RelayCellView<'_>) -> HandlerResult {
        let stream_id = rcell.stream_id();
        if stream_id == 0 {
            return Err(CellError::close_circuit(
                TorError::Protocol("no stream ID for RELAY_RESOLVE".into()),
                DestroyReason::Protocol,
            ));
        }

        let data = rcell.data();
        let name_len = data.iter().position(|&b| b == 0).unwrap_or(0);
        if name_len == 0 {
            return Err(CellError::close_circuit(
                TorError::Protocol("no DNS name in RELAY_RESOLVE".into()),
                DestroyReason::Protocol,
            ));
        }
        let name = String::from_utf8_lossy(&data[..name_len]).into_owned();
        crate::dns::resolve_async(name, circ.id, stream_id, self.circuit_tx.clone());
        Ok(())
    }

    /// DNS answers coming back from a resolver task.
    pub(crate) async fn handle_resolved(
        &self,
        circ: &mut Circuit,
        stream_id: u16,
        answers: Vec<DnsAddress>,
    ) -> HandlerResult {
        let mut payload = Vec::with_capacity(MAX_RELAY_LEN);
        for answer in &answers {
            if payload.len() + 6 + answer.value.len() > MAX_RELAY_LEN {
                break;
            }
            payload.push(answer.kind);
            payload.push(answer.value.len() as u8);
            payload.extend_from_slice(&answer.value);
            payload.extend_from_slice(&answer.ttl.to_be_bytes());
        }
        self.send_relay_cell(
            circ,
            stream_id,
            Direction::Backward,
            RelayCommand::Resolved,
            &payload,
        )
        .await
    }

    /// Stream lifecycle notifications from the stream tasks.
    pub(crate) async fn handle_stream_event(
        &self,
        circ: &mut Circuit,
        stream_id: u16,
        event: StreamEvent,
        reason: StreamEndReason,
        remote_addr: Option<Vec<u8>>,
    ) -> HandlerResult {
        match event {
            StreamEvent::Connected => {
                let data = connected_payload(remote_addr.as_deref());
                self.send_relay_cell(
                    circ,
                    stream_id,
                    Direction::Backward,
                    RelayCommand::Connected,
                    &data,
                )
                .await
            }
            StreamEvent::Disconnected => {
                let Some(stream) = circ.streams.remove(&stream_id) else {
                    return Ok(());
                };
                stream.destroy();
                let data = end_payload(reason, remote_addr.as_deref());
                self.send_relay_cell(
                    circ,
                    stream_id,
                    Direction::Backward,
                    RelayCommand::End,
                    &data,
                )
                .await
            }
            StreamEvent::Sendme => {
                if !circ.streams.contains_key(&stream_id) {
                    return Ok(());
                }
                self.send_relay_cell(
                    circ,
                    stream_id,
                    Direction::Backward,
                    RelayCommand::Sendme,
                    &[],
                )
                .await
            }
        }
    }

    /// Socket bytes from a stream task, chunked into backward RELAY_DATA.
    pub(crate) async fn handle_stream_bytes(
        &self,
        circ: &mut Circuit,
        stream_id: u16,
        data: CellBuf,
    ) -> HandlerResult {
        for chunk in data.chunks(MAX_RELAY_LEN) {
            self.send_relay_cell(circ, stream_id, Direction::Backward, RelayCommand::Data, chunk)
                .await?;
        }
        Ok(())
    }
}

/// The recognized test against one direction's rolling digest. The digest
/// is updated speculatively over the body with its digest field zeroed; a
/// miss restores the snapshot so failed checks leave no trace.
pub(crate) fn recognize(state: &mut crate::circuit::DirectionState, body: &[u8]) -> bool {
    if !RelayCellView::new(body).recognized() {
        return false;
    }
    let mut probe = CellBuf::copy_from(body);
    probe[5..9].fill(0);
    let snapshot = state.digest.clone();
    sha1::Digest::update(&mut state.digest, &probe[..]);
    let sum = sha1::Digest::finalize(state.digest.clone());
    if sum[..4] == body[5..9] {
        true
    } else {
        state.digest = snapshot;
        false
    }
}

/// RELAY_CONNECTED payload: address bytes plus a TTL. IPv6 answers get the
/// 0.0.0.0 marker prefix.
fn connected_payload(remote_addr: Option<&[u8]>) -> Vec<u8> {
    match remote_addr {
        Some(addr) if addr.len() == 4 => {
            let mut data = Vec::with_capacity(8);
            data.extend_from_slice(addr);
            data.extend_from_slice(&CONNECTED_TTL.to_be_bytes());
            data
        }
        Some(addr) if addr.len() == 16 => {
            let mut data = Vec::with_capacity(25);
            data.extend_from_slice(&[0, 0, 0, 0, 6]);
            data.extend_from_slice(addr);
            data.extend_from_slice(&CONNECTED_TTL.to_be_bytes());
            data
        }
        _ => Vec::new(),
    }
}

/// RELAY_END payload: reason byte, optionally followed by the remote
/// address and TTL in the RELAY_CONNECTED layout.
fn end_payload(reason: StreamEndReason, remote_addr: Option<&[u8]>) -> Vec<u8> {
    let mut data = vec![reason as u8];
    data.extend_from_slice(&connected_payload(remote_addr));
    data
}
