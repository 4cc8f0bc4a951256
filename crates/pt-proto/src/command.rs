use std::fmt;

use thiserror::Error;

pub const START_MARKER: char = '<';
pub const END_MARKER: char = '>';
pub const PARAM_SEPARATOR: char = ',';

/// One host request, parsed eagerly so handlers never look at raw text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Absolute move, degrees.
    Move { pan: i32, tilt: i32 },
    /// Relative move from the cached angles, degrees.
    MoveBy { pan: i32, tilt: i32 },
    Stop,
    Home,
    SetSpeed(i32),
    /// Both angles, fresh read with cached fallback.
    Pos,
    /// Aggregate: both angles plus both axes' voltage and temperature.
    Status,
    /// Aggregate: both temperatures.
    Temp,
    /// Aggregate: both voltages.
    Volt,
    ReadAngle(i32),
    ReadVoltTemp(i32),
    GetInfo,
    Laser(bool),
    /// Status LED.
    Led(bool),
    Beep,
    /// Sweeps both axes through centre and their limits, then parks.
    Calibrate,
    /// Broadcast a new hardware id to the single servo on the bus.
    ConfigServo(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Empty command")]
    Empty,
    #[error("Missing end marker")]
    Unterminated,
    #[error("Unknown command")]
    UnknownVerb(String),
    #[error("Invalid parameter")]
    BadParam { verb: &'static str, param: String },
    #[error("{verb} expects {expected} parameter(s), got {got}")]
    Arity { verb: &'static str, expected: usize, got: usize },
}

impl Command {
    /// Parses `<VERB:p1,p2>` (markers optional). Verb matching ignores case.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let inner = match line.strip_prefix(START_MARKER) {
            Some(rest) => rest.strip_suffix(END_MARKER).ok_or(ParseError::Unterminated)?,
            None => line,
        };
        let inner = inner.trim();
        if inner.is_empty() {
            return Err(ParseError::Empty);
        }

        let (verb, params) = match inner.split_once(':') {
            Some((v, p)) => (v.trim(), p.trim()),
            None => (inner, ""),
        };
        let verb = verb.to_ascii_uppercase();

        let cmd = match verb.as_str() {
            "MOVE" | "MOVETO" => {
                let [pan, tilt] = ints::<2>("MOVE", params)?;
                Command::Move { pan, tilt }
            }
            "MOVER" | "MOVEBY" => {
                let [pan, tilt] = ints::<2>("MOVEBY", params)?;
                Command::MoveBy { pan, tilt }
            }
            "STOP" => {
                ints::<0>("STOP", params)?;
                Command::Stop
            }
            "HOME" => {
                ints::<0>("HOME", params)?;
                Command::Home
            }
            "SETSPEED" | "SPEED" => {
                let [v] = ints::<1>("SETSPEED", params)?;
                Command::SetSpeed(v)
            }
            "POS" | "GETPOS" | "READ" | "READPOS" => {
                ints::<0>("POS", params)?;
                Command::Pos
            }
            "STATUS" | "INFO" => {
                ints::<0>("STATUS", params)?;
                Command::Status
            }
            "TEMP" | "TEMPERATURE" => {
                ints::<0>("TEMP", params)?;
                Command::Temp
            }
            "VOLT" | "VOLTAGE" => {
                ints::<0>("VOLT", params)?;
                Command::Volt
            }
            "READANGLE" => {
                let [id] = ints::<1>("READANGLE", params)?;
                Command::ReadAngle(id)
            }
            "READVOLTTEMP" | "READVOLTEMP" => {
                let [id] = ints::<1>("READVOLTTEMP", params)?;
                Command::ReadVoltTemp(id)
            }
            "GETINFO" => {
                ints::<0>("GETINFO", params)?;
                Command::GetInfo
            }
            "LASER" => Command::Laser(switch("LASER", params)?),
            "LED" => Command::Led(switch("LED", params)?),
            "CAL" | "CALIBRATE" => {
                ints::<0>("CAL", params)?;
                Command::Calibrate
            }
            "BEEP" => {
                ints::<0>("BEEP", params)?;
                Command::Beep
            }
            "CONFIGSERVO" => {
                let [id] = ints::<1>("CONFIGSERVO", params)?;
                Command::ConfigServo(id)
            }
            _ => return Err(ParseError::UnknownVerb(verb)),
        };
        Ok(cmd)
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::Move { .. } => "MOVE",
            Command::MoveBy { .. } => "MOVEBY",
            Command::Stop => "STOP",
            Command::Home => "HOME",
            Command::SetSpeed(_) => "SETSPEED",
            Command::Pos => "POS",
            Command::Status => "STATUS",
            Command::Temp => "TEMP",
            Command::Volt => "VOLT",
            Command::ReadAngle(_) => "READANGLE",
            Command::ReadVoltTemp(_) => "READVOLTTEMP",
            Command::GetInfo => "GETINFO",
            Command::Laser(_) => "LASER",
            Command::Led(_) => "LED",
            Command::Beep => "BEEP",
            Command::Calibrate => "CAL",
            Command::ConfigServo(_) => "CONFIGSERVO",
        }
    }

    /// Verbs still answered while discovery has failed.
    pub fn answered_in_fault(&self) -> bool {
        matches!(self, Command::GetInfo | Command::Status | Command::Beep)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = self.verb();
        match *self {
            Command::Move { pan, tilt } | Command::MoveBy { pan, tilt } => {
                write!(f, "<{verb}:{pan},{tilt}>")
            }
            Command::SetSpeed(v)
            | Command::ReadAngle(v)
            | Command::ReadVoltTemp(v)
            | Command::ConfigServo(v) => write!(f, "<{verb}:{v}>"),
            Command::Laser(on) | Command::Led(on) => write!(f, "<{verb}:{}>", if on { "ON" } else { "OFF" }),
            _ => write!(f, "<{verb}>"),
        }
    }
}

fn switch(verb: &'static str, param: &str) -> Result<bool, ParseError> {
    match param.to_ascii_uppercase().as_str() {
        "ON" | "1" => Ok(true),
        "OFF" | "0" => Ok(false),
        _ => Err(ParseError::BadParam { verb, param: param.to_string() }),
    }
}

fn ints<const N: usize>(verb: &'static str, params: &str) -> Result<[i32; N], ParseError> {
    let parts: Vec<&str> = if params.is_empty() {
        Vec::new()
    } else {
        params.split(PARAM_SEPARATOR).map(str::trim).collect()
    };
    if parts.len() != N {
        return Err(ParseError::Arity { verb, expected: N, got: parts.len() });
    }
    let mut out = [0i32; N];
    for (slot, p) in out.iter_mut().zip(parts) {
        *slot = p
            .parse::<i32>()
            .map_err(|_| ParseError::BadParam { verb, param: p.to_string() })?;
    }
    Ok(out)
}
