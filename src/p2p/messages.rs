//! Messages exchanged between darknodes of a pool

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DarknodeError;
use crate::smpc::DeltaFragment;

/// Maximum frame size (10MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Wire tag of [`Computation::DeltaFragment`].
pub const DELTA_FRAGMENT_TAG: u16 = 1;

/// Unit of work exchanged over a peer channel.
///
/// Tags are part of the wire format and never reused. A tag this node does
/// not know decodes as [`Computation::Unknown`] so newer peers can add
/// variants without breaking older ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Computation {
    /// Serialized [`DeltaFragment`]
    DeltaFragment(Vec<u8>),
    Unknown { tag: u16, payload: Vec<u8> },
}

/// On-the-wire envelope
#[derive(Serialize, Deserialize, Debug)]
struct Envelope {
    tag: u16,
    payload: Vec<u8>,
}

impl Computation {
    pub fn from_delta_fragment(fragment: &DeltaFragment) -> Result<Self, DarknodeError> {
        Ok(Computation::DeltaFragment(fragment.to_bytes()?))
    }

    pub fn tag(&self) -> u16 {
        match self {
            Computation::DeltaFragment(_) => DELTA_FRAGMENT_TAG,
            Computation::Unknown { tag, .. } => *tag,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DarknodeError> {
        let payload = match self {
            Computation::DeltaFragment(bytes) => bytes,
            Computation::Unknown { payload, .. } => payload,
        };
        let envelope = Envelope {
            tag: self.tag(),
            payload: payload.clone(),
        };
        Ok(bincode::serialize(&envelope)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DarknodeError> {
        let envelope: Envelope = bincode::deserialize(bytes)?;
        Ok(match envelope.tag {
            DELTA_FRAGMENT_TAG => Computation::DeltaFragment(envelope.payload),
            tag => Computation::Unknown {
                tag,
                payload: envelope.payload,
            },
        })
    }
}

/// Writes one length-prefixed frame (4-byte big-endian length, then the body).
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    computation: &Computation,
) -> Result<(), DarknodeError> {
    let data = computation.to_bytes()?;
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(DarknodeError::Serialization(format!(
            "frame too large: {} bytes",
            data.len()
        )));
    }

    stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the body of one frame without decoding it. Returns `None` on a
/// clean end of stream before a length prefix; a stream ending inside a
/// frame is an error.
pub async fn read_frame_bytes<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<Vec<u8>>, DarknodeError> {
    let mut len_bytes = [0u8; 4];
    if stream.read(&mut len_bytes[..1]).await? == 0 {
        return Ok(None);
    }
    stream.read_exact(&mut len_bytes[1..]).await?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(DarknodeError::Serialization(format!(
            "frame too large: {} bytes",
            len
        )));
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(Some(data))
}

/// Reads and decodes one frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<Computation>, DarknodeError> {
    match read_frame_bytes(stream).await? {
        Some(data) => Computation::from_bytes(&data).map(Some),
        None => Ok(None),
    }
}
