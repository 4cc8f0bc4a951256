pub mod command;
pub mod response;
pub mod startup;
pub mod telemetry;

pub use command::{Command, ParseError};
pub use response::{Response, Status};
pub use startup::{AngleBounds, StartupInfo};
pub use telemetry::{TrackEvent, TrackMode};

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
