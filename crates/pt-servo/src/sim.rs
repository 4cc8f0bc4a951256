//! In-process stand-in for a chain of LX-series bus servos. Speaks the binary
//! protocol over any byte stream, typically one end of `tokio::io::duplex`.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::packet::{read_raw_frame, CommandCode, Packet, BROADCAST_ID};
use crate::POSITION_MAX;

#[derive(Debug, Clone)]
pub struct SimServo {
    pub id: u8,
    pub position: i16,
    pub move_time_ms: u16,
    pub voltage_mv: u16,
    pub temperature_c: u8,
    /// Ignores every request.
    pub silent: bool,
    /// Ignores this many requests, then answers normally.
    pub drop_requests: u32,
    /// Flips the checksum of this many replies.
    pub corrupt_replies: u32,
}

impl SimServo {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            position: 500,
            move_time_ms: 0,
            voltage_mv: 7400,
            temperature_c: 35,
            silent: false,
            drop_requests: 0,
            corrupt_replies: 0,
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    servos: Vec<SimServo>,
    echo: bool,
    requests: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<BusState>>,
}

impl SimBus {
    pub fn new(servos: Vec<SimServo>) -> Self {
        Self { state: Arc::new(Mutex::new(BusState { servos, ..BusState::default() })) }
    }

    pub fn with_ids(ids: &[u8]) -> Self {
        Self::new(ids.iter().map(|&id| SimServo::new(id)).collect())
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mutates servo `id`; `None` if no such servo.
    pub fn update<R>(&self, id: u8, f: impl FnOnce(&mut SimServo) -> R) -> Option<R> {
        self.lock().servos.iter_mut().find(|s| s.id == id).map(f)
    }

    pub fn servo(&self, id: u8) -> Option<SimServo> {
        self.lock().servos.iter().find(|s| s.id == id).cloned()
    }

    /// Copies every request back onto the wire before answering, like a
    /// single-wire adapter without echo suppression.
    pub fn set_echo(&self, on: bool) {
        self.lock().echo = on;
    }

    /// Frames received so far, valid or not.
    pub fn requests(&self) -> u64 {
        self.lock().requests
    }

    pub fn spawn<S>(&self, io: S) -> JoinHandle<std::io::Result<()>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let bus = self.clone();
        tokio::spawn(async move { bus.serve(io).await })
    }

    /// Answers requests until the stream closes.
    pub async fn serve<S>(&self, mut io: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let raw = match read_raw_frame(&mut io).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            let (echo, reply) = {
                let mut st = self.lock();
                st.requests += 1;
                let reply = match raw.as_deref().map(Packet::decode) {
                    Ok(Ok(req)) => st.handle(&req),
                    _ => {
                        debug!("sim bus: dropping malformed frame");
                        None
                    }
                };
                (st.echo.then(|| raw.clone().ok()).flatten(), reply)
            };
            if let Some(echo) = echo {
                io.write_all(&echo).await?;
            }
            if let Some(reply) = reply {
                io.write_all(&reply).await?;
            }
            io.flush().await?;
        }
    }
}

impl BusState {
    fn handle(&mut self, req: &Packet) -> Option<Vec<u8>> {
        if req.id == BROADCAST_ID {
            if req.command == CommandCode::IdWrite && self.servos.len() == 1 {
                if let Some(&new_id) = req.params.first() {
                    debug!("sim bus: servo {} renumbered to {}", self.servos[0].id, new_id);
                    self.servos[0].id = new_id;
                }
            }
            return None;
        }

        let servo = self.servos.iter_mut().find(|s| s.id == req.id)?;
        if servo.silent {
            return None;
        }
        if servo.drop_requests > 0 {
            servo.drop_requests -= 1;
            return None;
        }
        trace!("sim bus: servo {} <- {:?}", servo.id, req.command);

        let params: Vec<u8> = match req.command {
            CommandCode::MoveTimeWrite => {
                if let (Some(pos), Some(time)) = (req.u16_param(0), req.u16_param(2)) {
                    servo.position = (pos as i32).min(POSITION_MAX) as i16;
                    servo.move_time_ms = time;
                }
                return None;
            }
            CommandCode::Stop => return None,
            CommandCode::IdWrite => {
                if let Some(&new_id) = req.params.first() {
                    servo.id = new_id;
                }
                return None;
            }
            CommandCode::PosRead => servo.position.to_le_bytes().to_vec(),
            CommandCode::VoltageRead => servo.voltage_mv.to_le_bytes().to_vec(),
            CommandCode::TempRead => vec![servo.temperature_c],
            CommandCode::MoveTimeRead => {
                let mut p = servo.position.to_le_bytes().to_vec();
                p.extend_from_slice(&servo.move_time_ms.to_le_bytes());
                p
            }
        };

        let mut wire = Packet::new(servo.id, req.command, &params).ok()?.encode().to_vec();
        if servo.corrupt_replies > 0 {
            servo.corrupt_replies -= 1;
            if let Some(last) = wire.last_mut() {
                *last ^= 0xFF;
            }
        }
        Some(wire)
    }
}
