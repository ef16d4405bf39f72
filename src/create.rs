//! Circuit creation
//!
//! CREATE_FAST, legacy CREATE (TAP, or ntor behind the magic prefix), and
//! CREATE2 handling. All three install a fresh [`Circuit`] keyed from the
//! handshake output and answer with the matching CREATED variant.

use zeroize::Zeroize;

use crate::circuit::Circuit;
use crate::connection::OnionConnection;
use crate::error::{CellError, DestroyReason, HandlerResult, TorError};
use crate::protocol::{kdf::kdf_tor, ntor, tap, Cell, CellCommand, CircuitId};

/// Handshake type codes carried in CREATE2 and EXTEND2.
pub const HANDSHAKE_TAP: u16 = 0x0000;
pub const HANDSHAKE_NTOR: u16 = 0x0002;

/// Marker some clients use to smuggle an ntor handshake inside a legacy
/// CREATE cell.
const NTOR_MAGIC: &[u8; 16] = b"ntorNTORntorNTOR";

impl OnionConnection {
    /// Sanity checks shared by every CREATE variant: a real circuit ID
    /// with the initiator bit belonging to the peer's side of the link.
    fn check_new_circ_id(&self, id: CircuitId) -> HandlerResult {
        if id.is_zero() {
            return Err(CellError::close_connection(TorError::Protocol(
                "refusing to create circuit 0".into(),
            )));
        }
        if id.initiator_bit() == self.is_outbound {
            return Err(CellError::close_connection(TorError::Protocol(format!(
                "refusing an invalid circuit ID {id}"
            ))));
        }
        Ok(())
    }

    pub(crate) async fn handle_create_fast(&mut self, cell: Cell) -> HandlerResult {
        let circ_id = cell.circ_id();
        log::debug!("got a CREATE_FAST for circuit {circ_id}");
        self.check_new_circ_id(circ_id)?;
        if self.circuits.contains_key(&circ_id) {
            return Err(CellError::refuse_circuit(
                TorError::Protocol("circuit already exists".into()),
                DestroyReason::Protocol,
            ));
        }

        let mut reply = Cell::new(self.version, circ_id, CellCommand::CreatedFast, &[]);
        let payload = reply.payload_mut();
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut payload[..20]);

        // Key material from X | Y via KDF-TOR; KH goes back to the client.
        let mut seed = [0u8; 40];
        seed[..20].copy_from_slice(&cell.payload()[..20]);
        seed[20..].copy_from_slice(&payload[..20]);
        let mut km = kdf_tor(92, &seed);
        payload[20..40].copy_from_slice(&km[..20]);

        let circ = Circuit::new(circ_id, &km[20..40], &km[40..60], &km[60..76], &km[76..92]);
        seed.zeroize();
        km.zeroize();
        self.circuits.insert(circ_id, circ);
        self.queue_cell(reply).await;
        Ok(())
    }

    pub(crate) async fn handle_create(&mut self, cell: Cell, new_handshake: bool) -> HandlerResult {
        let circ_id = cell.circ_id();
        log::debug!("got a CREATE for circuit {circ_id}");
        self.check_new_circ_id(circ_id)?;
        if self.circuits.contains_key(&circ_id) {
            return Err(CellError::refuse_circuit(
                TorError::Protocol("circuit already exists".into()),
                DestroyReason::Protocol,
            ));
        }

        let data = cell.payload();
        let (handshake_type, handshake_data) = if new_handshake {
            let handshake_type = u16::from_be_bytes([data[0], data[1]]);
            let length = u16::from_be_bytes([data[2], data[3]]) as usize;
            if length > data.len() - 4 {
                return Err(CellError::refuse_circuit(
                    TorError::MalformedCell("malformed CREATE2 cell".into()),
                    DestroyReason::Protocol,
                ));
            }
            (handshake_type, &data[4..4 + length])
        } else if data.len() > 32 && data[..16] == NTOR_MAGIC[..] {
            (HANDSHAKE_NTOR, &data[16..data.len() - 16])
        } else {
            (HANDSHAKE_TAP, data)
        };

        match handshake_type {
            HANDSHAKE_TAP => self.create_tap(circ_id, handshake_data, new_handshake).await,
            HANDSHAKE_NTOR => self.create_ntor(circ_id, handshake_data, new_handshake).await,
            other => Err(CellError::refuse_circuit(
                TorError::Protocol(format!("unknown handshake type {other}")),
                DestroyReason::Protocol,
            )),
        }
    }

    async fn create_tap(
        &mut self,
        circ_id: CircuitId,
        data: &[u8],
        new_handshake: bool,
    ) -> HandlerResult {
        if data.len() < 186 {
            return Err(CellError::refuse_circuit(
                TorError::MalformedCell("TAP onionskin too short".into()),
                DestroyReason::Protocol,
            ));
        }

        let mut client_public =
            crate::protocol::hybrid::hybrid_decrypt(self.or.onion_key(), &data[..186]).map_err(
                |e| CellError::refuse_circuit(e, DestroyReason::Internal),
            )?;
        if client_public.len() != tap::TAP_CLIENT_LEN {
            return Err(CellError::refuse_circuit(
                TorError::Handshake("invalid TAP handshake found".into()),
                DestroyReason::Internal,
            ));
        }

        let response = tap::server_handshake(&client_public)
            .map_err(|e| CellError::refuse_circuit(e, DestroyReason::Internal))?;
        client_public.zeroize();
        let km = &response.key_material;

        let command = if new_handshake {
            CellCommand::Created2
        } else {
            CellCommand::Created
        };
        let mut reply = Cell::new(self.version, circ_id, command, &[]);
        let payload = reply.payload_mut();
        if new_handshake {
            payload[0..2].copy_from_slice(&(tap::TAP_SERVER_REPLY_LEN as u16).to_be_bytes());
            payload[2..130].copy_from_slice(&response.public);
            payload[130..150].copy_from_slice(&km[..20]);
        } else {
            payload[..128].copy_from_slice(&response.public);
            payload[128..148].copy_from_slice(&km[..20]);
        }

        let circ = Circuit::new(circ_id, &km[20..40], &km[40..60], &km[60..76], &km[76..92]);
        self.circuits.insert(circ_id, circ);
        self.queue_cell(reply).await;
        Ok(())
    }

    async fn create_ntor(
        &mut self,
        circ_id: CircuitId,
        data: &[u8],
        new_handshake: bool,
    ) -> HandlerResult {
        let response = ntor::server_handshake(
            data,
            self.tls.fingerprint.as_bytes(),
            self.or.ntor_keys(),
        )
        .map_err(|e| CellError::refuse_circuit(e, DestroyReason::Protocol))?;

        let command = if new_handshake {
            CellCommand::Created2
        } else {
            CellCommand::Created
        };
        let mut reply = Cell::new(self.version, circ_id, command, &[]);
        let payload = reply.payload_mut();
        if new_handshake {
            payload[0..2].copy_from_slice(&(ntor::SERVER_REPLY_LEN as u16).to_be_bytes());
            payload[2..66].copy_from_slice(&response.reply);
        } else {
            payload[..64].copy_from_slice(&response.reply);
        }

        let circ = Circuit::from_key_material(circ_id, &response.key_material);
        self.circuits.insert(circ_id, circ);
        self.queue_cell(reply).await;
        Ok(())
    }
}
