use std::fmt;

/// Sub-state of READY, one host line at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Accumulating,
    Dispatching,
    Aggregating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Boot,
    Discovering,
    Ready(Phase),
    /// Discovery failed. Left only by an external reset.
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    StartDiscovery,
    AxesAssigned,
    DiscoveryFailed,
    /// First byte of a new host line.
    LineStarted,
    LineComplete,
    /// Overflow or blank line; nothing to dispatch.
    LineDiscarded,
    AggregateStarted,
    Responded,
    WatchdogTrip,
}

/// Every legal move of the controller. Pairs not listed leave the state as it is.
pub fn transition(state: State, event: Event) -> State {
    use Event::*;
    use Phase::*;

    match (state, event) {
        (State::Fault, _) => State::Fault,
        (_, WatchdogTrip) => State::Boot,

        (State::Boot, StartDiscovery) => State::Discovering,
        (State::Discovering, AxesAssigned) => State::Ready(Idle),
        (State::Discovering, DiscoveryFailed) => State::Fault,

        (State::Ready(Idle), LineStarted) => State::Ready(Accumulating),
        (State::Ready(Accumulating), LineComplete) => State::Ready(Dispatching),
        (State::Ready(Idle | Accumulating), LineDiscarded) => State::Ready(Idle),
        (State::Ready(Dispatching), AggregateStarted) => State::Ready(Aggregating),
        (State::Ready(Dispatching | Aggregating), Responded) => State::Ready(Idle),

        (s, _) => s,
    }
}

impl State {
    pub fn is_ready(&self) -> bool {
        matches!(self, State::Ready(_))
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Boot => f.write_str("BOOT"),
            State::Discovering => f.write_str("DISCOVERING"),
            State::Ready(p) => write!(f, "READY/{}", format!("{p:?}").to_ascii_uppercase()),
            State::Fault => f.write_str("FAULT"),
        }
    }
}
