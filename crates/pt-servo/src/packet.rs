use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HEADER: [u8; 2] = [0x55, 0x55];
pub const BROADCAST_ID: u8 = 0xFE;

/// Parameter bytes a frame may carry. The longest LX-series frame uses 7.
pub const MAX_PARAMS: usize = 16;

/// Smallest legal length byte: length + command + checksum, no parameters.
const MIN_LENGTH: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    MoveTimeWrite = 1,
    MoveTimeRead = 2,
    Stop = 12,
    IdWrite = 13,
    TempRead = 26,
    VoltageRead = 27,
    PosRead = 28,
}

impl TryFrom<u8> for CommandCode {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => Self::MoveTimeWrite,
            2 => Self::MoveTimeRead,
            12 => Self::Stop,
            13 => Self::IdWrite,
            26 => Self::TempRead,
            27 => Self::VoltageRead,
            28 => Self::PosRead,
            other => return Err(FrameError::UnknownCommand(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("missing 0x55 0x55 header")]
    BadHeader,
    #[error("length byte {0} out of range")]
    BadLength(u8),
    #[error("frame is {got} bytes, length byte implies {expected}")]
    Truncated { expected: usize, got: usize },
    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    Checksum { computed: u8, received: u8 },
    #[error("unknown command code {0}")]
    UnknownCommand(u8),
    #[error("{0} parameter bytes do not fit in one frame")]
    TooManyParams(usize),
}

/// One bus frame: `55 55 id len cmd params.. checksum`.
///
/// `len` counts itself, the command byte, the parameters and the checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u8,
    pub command: CommandCode,
    pub params: heapless::Vec<u8, MAX_PARAMS>,
}

/// One's complement of the byte sum, modulo 256. `body` runs from the id
/// through the last parameter byte.
pub fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

impl Packet {
    pub fn new(id: u8, command: CommandCode, params: &[u8]) -> Result<Self, FrameError> {
        let params =
            heapless::Vec::from_slice(params).map_err(|_| FrameError::TooManyParams(params.len()))?;
        Ok(Self { id, command, params })
    }

    fn bare(id: u8, command: CommandCode) -> Self {
        Self { id, command, params: heapless::Vec::new() }
    }

    pub fn move_time_write(id: u8, position: u16, time_ms: u16) -> Self {
        let mut p = Self::bare(id, CommandCode::MoveTimeWrite);
        for b in position.to_le_bytes().into_iter().chain(time_ms.to_le_bytes()) {
            // four bytes always fit
            let _ = p.params.push(b);
        }
        p
    }

    pub fn read(id: u8, command: CommandCode) -> Self {
        Self::bare(id, command)
    }

    pub fn stop(id: u8) -> Self {
        Self::bare(id, CommandCode::Stop)
    }

    pub fn id_write(current_id: u8, new_id: u8) -> Self {
        let mut p = Self::bare(current_id, CommandCode::IdWrite);
        let _ = p.params.push(new_id);
        p
    }

    pub fn length_byte(&self) -> u8 {
        self.params.len() as u8 + MIN_LENGTH
    }

    pub fn wire_len(&self) -> usize {
        self.length_byte() as usize + 3
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_slice(&HEADER);
        buf.put_u8(self.id);
        buf.put_u8(self.length_byte());
        buf.put_u8(self.command as u8);
        buf.put_slice(&self.params);
        let sum = checksum(&buf[2..]);
        buf.put_u8(sum);
        buf.freeze()
    }

    /// Validates header, length and checksum of one complete frame.
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < 2 || frame[..2] != HEADER {
            return Err(FrameError::BadHeader);
        }
        if frame.len() < 6 {
            return Err(FrameError::Truncated { expected: 6, got: frame.len() });
        }
        let len = frame[3];
        if len < MIN_LENGTH || (len - MIN_LENGTH) as usize > MAX_PARAMS {
            return Err(FrameError::BadLength(len));
        }
        let expected = len as usize + 3;
        if frame.len() != expected {
            return Err(FrameError::Truncated { expected, got: frame.len() });
        }
        let computed = checksum(&frame[2..expected - 1]);
        let received = frame[expected - 1];
        if computed != received {
            return Err(FrameError::Checksum { computed, received });
        }
        let command = CommandCode::try_from(frame[4])?;
        Packet::new(frame[2], command, &frame[5..expected - 1])
    }

    pub fn u16_param(&self, offset: usize) -> Option<u16> {
        let lo = *self.params.get(offset)?;
        let hi = *self.params.get(offset + 1)?;
        Some(u16::from_le_bytes([lo, hi]))
    }
}

/// Reads one raw frame, skipping any noise ahead of the header. The frame is
/// not checksum-verified here.
pub(crate) async fn read_raw_frame<R>(io: &mut R) -> std::io::Result<Result<Vec<u8>, FrameError>>
where
    R: AsyncRead + Unpin,
{
    let mut prev = io.read_u8().await?;
    loop {
        let b = io.read_u8().await?;
        if prev == HEADER[0] && b == HEADER[1] {
            break;
        }
        prev = b;
    }
    let id = io.read_u8().await?;
    let len = io.read_u8().await?;
    if len < MIN_LENGTH || (len - MIN_LENGTH) as usize > MAX_PARAMS {
        return Ok(Err(FrameError::BadLength(len)));
    }
    let mut frame = Vec::with_capacity(len as usize + 3);
    frame.extend_from_slice(&HEADER);
    frame.push(id);
    frame.push(len);
    let mut rest = vec![0u8; len as usize - 1];
    io.read_exact(&mut rest).await?;
    frame.extend_from_slice(&rest);
    Ok(Ok(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    #[test]
    fn move_frame_matches_lx_layout() {
        let p = Packet::move_time_write(1, 500, 1000);
        let wire = p.encode();
        // 55 55 id=1 len=7 cmd=1 pos=0x01f4 time=0x03e8
        assert_eq!(&wire[..9], &[0x55, 0x55, 0x01, 0x07, 0x01, 0xF4, 0x01, 0xE8, 0x03]);
        let sum: u8 = [0x01u8, 0x07, 0x01, 0xF4, 0x01, 0xE8, 0x03]
            .iter()
            .fold(0u8, |a, b| a.wrapping_add(*b));
        assert_eq!(wire[9], !sum);
        assert_eq!(Packet::decode(&wire), Ok(p));
    }

    #[test]
    fn random_payloads_validate_and_any_flip_fails() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let n = rng.gen_range(0..=MAX_PARAMS);
            let mut params = vec![0u8; n];
            rng.fill_bytes(&mut params);
            let p = Packet::new(rng.gen(), CommandCode::MoveTimeRead, &params).unwrap();
            let wire = p.encode().to_vec();
            assert_eq!(Packet::decode(&wire).as_ref(), Ok(&p));

            if n > 0 {
                let mut bad = wire.clone();
                let i = 5 + rng.gen_range(0..n);
                bad[i] ^= 1 << rng.gen_range(0..8);
                assert!(matches!(Packet::decode(&bad), Err(FrameError::Checksum { .. })));
            }
        }
    }

    #[test]
    fn decode_rejects_bad_shapes() {
        assert_eq!(Packet::decode(&[0x55, 0x54, 1, 3, 28, 0]), Err(FrameError::BadHeader));
        assert_eq!(Packet::decode(&[0x55, 0x55, 1, 2, 28, 0]), Err(FrameError::BadLength(2)));
        let mut wire = Packet::read(3, CommandCode::PosRead).encode().to_vec();
        wire.push(0);
        assert!(matches!(Packet::decode(&wire), Err(FrameError::Truncated { .. })));
    }

    #[tokio::test]
    async fn raw_reader_skips_noise() {
        let mut bytes = vec![0x00, 0x55, 0x12];
        bytes.extend_from_slice(&Packet::read(2, CommandCode::TempRead).encode());
        let mut rd = &bytes[..];
        let frame = read_raw_frame(&mut rd).await.unwrap().unwrap();
        assert_eq!(Packet::decode(&frame).unwrap().id, 2);
    }
}
