use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace};

use crate::packet::{read_raw_frame, CommandCode, FrameError, Packet};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus read timed out")]
    Timeout,
    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    Checksum { computed: u8, received: u8 },
    #[error("malformed frame: {0}")]
    BadFrame(FrameError),
    #[error("reply from id {got_id} ({got_command:?}) to a {command:?} request for id {expected_id}")]
    UnexpectedReply { expected_id: u8, command: CommandCode, got_id: u8, got_command: CommandCode },
    #[error("{0:?} reply payload too short")]
    ShortReply(CommandCode),
    #[error("bus closed")]
    Closed,
    #[error("bus i/o: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for BusError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Checksum { computed, received } => BusError::Checksum { computed, received },
            other => BusError::BadFrame(other),
        }
    }
}

/// Opens the servo bus port (8N1, no flow control).
pub fn open_serial(dev: &str, baud: u32) -> Result<SerialStream, BusError> {
    let port = tokio_serial::new(dev, baud).open_native_async().map_err(io::Error::from)?;
    debug!("servo bus open: {} @ {}", dev, baud);
    Ok(port)
}

/// Half-duplex servo bus. At most one exchange is in flight; every reply is
/// checked against the request's target id and command code.
pub struct BusTransport<S> {
    io: S,
    exchange_timeout: Duration,
}

impl<S> BusTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: S, exchange_timeout: Duration) -> Self {
        Self { io, exchange_timeout }
    }

    pub fn exchange_timeout(&self) -> Duration {
        self.exchange_timeout
    }

    pub fn into_inner(self) -> S {
        self.io
    }

    /// Writes one frame. Writes are not time-bounded.
    pub async fn send(&mut self, packet: &Packet) -> Result<(), BusError> {
        trace!(id = packet.id, cmd = ?packet.command, "bus tx");
        self.io.write_all(&packet.encode()).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn receive(&mut self, wait: Duration) -> Result<Packet, BusError> {
        let raw = match timeout(wait, read_raw_frame(&mut self.io)).await {
            Err(_) => return Err(BusError::Timeout),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(BusError::Closed),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(raw)) => raw?,
        };
        let packet = Packet::decode(&raw)?;
        trace!(id = packet.id, cmd = ?packet.command, "bus rx");
        Ok(packet)
    }

    /// Drops leftovers of an earlier exchange, writes `request`, then waits up
    /// to `wait` for the matching reply. Our own echo on a single-wire bus is
    /// skipped.
    pub async fn send_and_receive(&mut self, request: &Packet, wait: Duration) -> Result<Packet, BusError> {
        let stale = self.drain().await?;
        if stale > 0 {
            debug!(bytes = stale, "discarded stale bus bytes");
        }
        self.send(request).await?;

        let deadline = Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let reply = self.receive(left).await?;
            if reply == *request {
                trace!(id = request.id, "skipping local echo");
                continue;
            }
            if reply.id != request.id || reply.command != request.command {
                return Err(BusError::UnexpectedReply {
                    expected_id: request.id,
                    command: request.command,
                    got_id: reply.id,
                    got_command: reply.command,
                });
            }
            return Ok(reply);
        }
    }

    /// Same as [`send_and_receive`](Self::send_and_receive) with the default exchange timeout.
    pub async fn exchange(&mut self, request: &Packet) -> Result<Packet, BusError> {
        let wait = self.exchange_timeout;
        self.send_and_receive(request, wait).await
    }

    async fn drain(&mut self) -> Result<usize, BusError> {
        let mut scratch = [0u8; 32];
        let mut total = 0;
        loop {
            match timeout(Duration::ZERO, self.io.read(&mut scratch)).await {
                Ok(Ok(0)) | Err(_) => return Ok(total),
                Ok(Ok(n)) => total += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}
