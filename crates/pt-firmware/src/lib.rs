pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod doctor;
pub mod line;
pub mod outputs;
pub mod state;
pub mod watchdog;

pub use config::FirmwareConfig;
pub use controller::Controller;
pub use dispatcher::{DispatchError, Dispatcher};
pub use outputs::{LogOutputs, Outputs};
pub use state::{Event, Phase, State};
