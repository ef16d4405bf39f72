//! Circuit extension
//!
//! A terminal hop asked to extend parses the link specifiers, hands a
//! request to the node registry, and parks the shared handshake state on
//! the circuit. Once the outbound leg reports CREATED, the next hop is
//! installed and RELAY_EXTENDED(2) goes back toward the client.

use crate::circuit::{Circuit, RelayCircuit};
use crate::commands::{CircuitCommand, CircuitRequest, ConnectionHint, ExtendState};
use crate::connection::OnionConnection;
use crate::create::HANDSHAKE_TAP;
use crate::error::{CellError, DestroyReason, HandlerResult, TorError};
use crate::protocol::{Cell, CellCommand, RelayCellView, RelayCommand};
use crate::relay::Direction;

impl OnionConnection {
    fn check_extendable(&self, circ: &Circuit) -> HandlerResult {
        if circ.next_hop.is_some() {
            return Err(CellError::close_circuit(
                TorError::Protocol("we already have a next hop".into()),
                DestroyReason::Protocol,
            ));
        }
        if circ.extend_state.is_some() {
            return Err(CellError::close_circuit(
                TorError::Protocol("refusing attempt to extend a circuit twice".into()),
                DestroyReason::Protocol,
            ));
        }
        Ok(())
    }

    /// The extension must not lead straight back to the hop that asked.
    fn check_not_source(&self, fingerprint: &[u8]) -> HandlerResult {
        if self.they_authenticated {
            if let Some(theirs) = &self.their_fingerprint {
                if theirs.as_bytes()[..] == fingerprint[..] {
                    return Err(CellError::close_circuit(
                        TorError::Protocol("not extending back to the source".into()),
                        DestroyReason::Protocol,
                    ));
                }
            }
        }
        Ok(())
    }

    async fn submit_extension(
        &self,
        circ: &mut Circuit,
        hint: ConnectionHint,
        handshake_type: u16,
        handshake_data: Vec<u8>,
        new_handshake: bool,
    ) -> HandlerResult {
        let state = ExtendState::new();
        let request = CircuitRequest {
            local_id: circ.id,
            hint,
            success_queue: self.circuit_tx.clone(),
            handshake_type,
            handshake_data,
            new_handshake,
            state: state.clone(),
        };
        circ.extend_state = Some(state);

        self.or
            .request_circuit(Box::new(request))
            .await
            .map_err(|e| {
                CellError::close_circuit(e, DestroyReason::Internal)
            })
    }

    /// Legacy RELAY_EXTEND: fixed layout of IPv4+port, TAP onionskin, and
    /// target fingerprint.
    pub(crate) async fn handle_relay_extend(
        &self,
        circ: &mut Circuit,
        rcell: &RelayCellView<'_>,
    ) -> HandlerResult {
        log::debug!("got an extend on circuit {}", circ.id);
        self.check_extendable(circ)?;

        let data = rcell.data();
        if data.len() != 212 {
            return Err(CellError::close_circuit(
                TorError::MalformedCell("malformed EXTEND cell".into()),
                DestroyReason::Protocol,
            ));
        }
        self.check_not_source(&data[192..212])?;

        let mut hint = ConnectionHint::default();
        hint.add_address(&data[0..6])
            .map_err(|e| CellError::close_circuit(e, DestroyReason::Protocol))?;
        hint.add_fingerprint(&data[192..212])
            .map_err(|e| CellError::close_circuit(e, DestroyReason::Protocol))?;

        self.submit_extension(circ, hint, HANDSHAKE_TAP, data[6..192].to_vec(), false)
            .await
    }

    /// RELAY_EXTEND2: counted link specifiers followed by a typed
    /// handshake.
    pub(crate) async fn handle_relay_extend2(
        &self,
        circ: &mut Circuit,
        rcell: &RelayCellView<'_>,
    ) -> HandlerResult {
        log::debug!("got an extend2 on circuit {}", circ.id);
        self.check_extendable(circ)?;

        let data = rcell.data();
        let malformed = || {
            CellError::close_circuit(
                TorError::MalformedCell("malformed EXTEND2 cell".into()),
                DestroyReason::Protocol,
            )
        };

        if data.is_empty() {
            return Err(malformed());
        }
        let nspec = data[0] as usize;
        if 1 + nspec * 2 + 4 > data.len() {
            return Err(malformed());
        }

        let mut hint = ConnectionHint::default();
        let mut pos = 1;
        for _ in 0..nspec {
            if pos + 2 > data.len() {
                return Err(malformed());
            }
            let ls_type = data[pos];
            let ls_len = data[pos + 1] as usize;
            pos += 2;
            if pos + ls_len > data.len().saturating_sub(4) {
                return Err(malformed());
            }
            let ls_data = &data[pos..pos + ls_len];
            pos += ls_len;

            match ls_type {
                0 | 1 => hint
                    .add_address(ls_data)
                    .map_err(|e| CellError::close_circuit(e, DestroyReason::Protocol))?,
                2 => {
                    hint.add_fingerprint(ls_data)
                        .map_err(|e| CellError::close_circuit(e, DestroyReason::Protocol))?;
                    self.check_not_source(ls_data)?;
                }
                other => log::info!("ignoring unknown link specifier type {other}"),
            }
        }

        if pos + 4 > data.len() {
            return Err(malformed());
        }
        let handshake_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let handshake_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if data.len() < pos + handshake_len {
            return Err(malformed());
        }
        if nspec < 2 {
            return Err(CellError::close_circuit(
                TorError::Protocol("EXTEND2 with too few link specifiers".into()),
                DestroyReason::Protocol,
            ));
        }

        self.submit_extension(
            circ,
            hint,
            handshake_type,
            data[pos..pos + handshake_len].to_vec(),
            true,
        )
        .await
    }

    /// CREATED/CREATED2 on the outbound link: pass the handshake data back
    /// to the circuit that requested the extension.
    pub(crate) async fn handle_created(&mut self, cell: Cell, new_handshake: bool) -> HandlerResult {
        let circ_id = cell.circ_id();
        let Some(rcirc) = self.relay_circuits.get(&circ_id) else {
            return Err(CellError::refuse_circuit(
                TorError::Protocol("CREATED for a circuit we never asked for".into()),
                DestroyReason::Protocol,
            ));
        };
        log::debug!("got a created for circuit {circ_id}");

        let data = cell.payload();
        let (pos, handshake_len) = if new_handshake {
            (2, u16::from_be_bytes([data[0], data[1]]) as usize)
        } else {
            (0, 148)
        };
        if pos + handshake_len > data.len() {
            return Err(CellError::close_circuit(
                TorError::MalformedCell("CREATED cell badly formed".into()),
                DestroyReason::Protocol,
            ));
        }

        let (queue, their_id) = (rcirc.previous_hop.clone(), rcirc.their_id);
        let _ = queue
            .send(CircuitCommand::Created {
                id: their_id,
                handshake: data[pos..pos + handshake_len].to_vec(),
                new_handshake,
            })
            .await;
        Ok(())
    }

    /// Back on the origin connection: install the next hop recorded by the
    /// dialer and report RELAY_EXTENDED(2) toward the client.
    pub(crate) async fn handle_circuit_created(
        &self,
        circ: &mut Circuit,
        handshake: Vec<u8>,
        new_handshake: bool,
    ) -> HandlerResult {
        if circ.next_hop.is_some() {
            return Err(CellError::close_circuit(
                TorError::Protocol("circuit created twice".into()),
                DestroyReason::Protocol,
            ));
        }
        let Some(extend) = circ.extend_state.take() else {
            return Err(CellError::close_circuit(
                TorError::Protocol("we never asked for an extension".into()),
                DestroyReason::Protocol,
            ));
        };
        let Some(next_hop) = extend.take_next_hop() else {
            return Err(CellError::close_circuit(
                TorError::Internal("extension completed without a next hop".into()),
                DestroyReason::Internal,
            ));
        };
        circ.next_hop = Some(next_hop);

        if new_handshake {
            let mut body = Vec::with_capacity(2 + handshake.len());
            body.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
            body.extend_from_slice(&handshake);
            self.send_relay_cell(circ, 0, Direction::Backward, RelayCommand::Extended2, &body)
                .await
        } else {
            self.send_relay_cell(circ, 0, Direction::Backward, RelayCommand::Extended, &handshake)
                .await
        }
    }

    /// A CircuitRequest reaching an outbound connection's run loop: pick a
    /// fresh ID, install the relay circuit, and send CREATE(2).
    pub(crate) async fn handle_circuit_request(
        &mut self,
        request: Box<CircuitRequest>,
    ) -> HandlerResult {
        let new_id = self.new_circ_id();

        if !request.state.install_next_hop(self.circuit_tx.clone(), new_id) {
            log::info!("aborting CREATE - origin is gone");
            return Ok(());
        }

        let command = if request.new_handshake {
            CellCommand::Create2
        } else {
            CellCommand::Create
        };
        let mut cell = Cell::new(self.version, new_id, command, &[]);
        let payload = cell.payload_mut();
        if request.new_handshake {
            payload[0..2].copy_from_slice(&request.handshake_type.to_be_bytes());
            payload[2..4].copy_from_slice(&(request.handshake_data.len() as u16).to_be_bytes());
            payload[4..4 + request.handshake_data.len()].copy_from_slice(&request.handshake_data);
        } else {
            payload[..request.handshake_data.len()].copy_from_slice(&request.handshake_data);
        }

        self.relay_circuits.insert(
            new_id,
            RelayCircuit {
                id: new_id,
                their_id: request.local_id,
                previous_hop: request.success_queue.clone(),
            },
        );
        self.queue_cell(cell).await;
        Ok(())
    }

    /// RELAY_TRUNCATE: drop the next hop (or cancel the pending extension)
    /// and confirm with RELAY_TRUNCATED.
    pub(crate) async fn handle_relay_truncate(&self, circ: &mut Circuit) -> HandlerResult {
        let dropped = if let Some(extend) = circ.extend_state.take() {
            extend.abort()
        } else {
            circ.next_hop.take()
        };
        if let Some((queue, next_id)) = dropped {
            let _ = queue
                .send(CircuitCommand::Destroyed {
                    id: next_id,
                    reason: DestroyReason::Requested,
                    for_relay: true,
                })
                .await;
        }
        self.send_relay_cell(
            circ,
            0,
            Direction::Backward,
            RelayCommand::Truncated,
            &[DestroyReason::Requested as u8],
        )
        .await
    }
}
