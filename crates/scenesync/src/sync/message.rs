use lib0::decoding::{Cursor, Read};
use lib0::encoding::Write;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

use crate::{SyncError, SyncResult};

const WIRE_VERSION: u8 = 1;
const FLAG_KNOWN: u8 = 0b01;
const FLAG_UPDATE: u8 = 0b10;

/// One step of the sync conversation with a single peer
///
/// Wire layout: `version:u8 flags:u8 state:buf [known:buf] [update:buf]`,
/// where every `buf` is a varint length followed by that many bytes.
#[derive(Debug, Clone)]
pub struct SyncMessage {
    /// Sender's version vector at the time of sending
    pub state: StateVector,
    /// What the sender believes the receiver's version vector is
    pub known: Option<StateVector>,
    /// CRDT update carrying operations the receiver is missing
    pub update: Option<Vec<u8>>,
}

impl SyncMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0;
        if self.known.is_some() {
            flags |= FLAG_KNOWN;
        }
        if self.update.is_some() {
            flags |= FLAG_UPDATE;
        }

        let mut encoder = Vec::new();
        encoder.write_u8(WIRE_VERSION);
        encoder.write_u8(flags);
        encoder.write_buf(self.state.encode_v1());
        if let Some(known) = &self.known {
            encoder.write_buf(known.encode_v1());
        }
        if let Some(update) = &self.update {
            encoder.write_buf(update);
        }
        encoder
    }

    pub fn decode(data: &[u8]) -> SyncResult<Self> {
        let mut decoder = Cursor::new(data);

        let version = decoder.read_u8().map_err(read_error)?;
        if version != WIRE_VERSION {
            return Err(SyncError::protocol(format!(
                "Unsupported sync message version {}",
                version
            )));
        }
        let flags = decoder.read_u8().map_err(read_error)?;

        let state = decode_state(decoder.read_buf().map_err(read_error)?)?;
        let known = if flags & FLAG_KNOWN != 0 {
            Some(decode_state(decoder.read_buf().map_err(read_error)?)?)
        } else {
            None
        };
        let update = if flags & FLAG_UPDATE != 0 {
            Some(decoder.read_buf().map_err(read_error)?.to_vec())
        } else {
            None
        };

        Ok(Self {
            state,
            known,
            update,
        })
    }
}

fn decode_state(data: &[u8]) -> SyncResult<StateVector> {
    StateVector::decode_v1(data)
        .map_err(|e| SyncError::protocol(format!("Invalid state vector: {}", e)))
}

fn read_error(e: lib0::error::Error) -> SyncError {
    SyncError::protocol(format!("Truncated sync message: {}", e))
}
