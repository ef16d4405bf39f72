//! Wire-level building blocks
//!
//! Everything below the connection actor: cell framing and buffering, the
//! stream codec, flow-control windows, and the handshake cryptography.

pub mod cell;
pub mod cellbuf;
pub mod codec;
pub mod hybrid;
pub mod kdf;
pub mod ntor;
pub mod tap;
pub mod window;

pub use cell::{
    Cell, CellCommand, CircuitId, LinkVersion, RelayCellView, RelayCommand, MAX_RELAY_LEN,
    PAYLOAD_LEN, RELAY_HEADER_LEN,
};
pub use cellbuf::{seed_pool, CellBuf, MAX_CELL_SIZE};
pub use codec::{CellReader, WriteBatcher, SSL_RECORD_SIZE};
pub use window::Window;
