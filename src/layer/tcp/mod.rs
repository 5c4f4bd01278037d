//! The TCP layer.
//!
//! Split in two halves: [`connection`] holds the per-flow state machine with its timers and
//! send logic, [`congestion`] the pluggable window governors it consults. The interface maps
//! wire segments to connections and back.
//!
//! [`connection`]: connection/index.html
//! [`congestion`]: congestion/index.html

mod congestion;
mod connection;

pub use self::congestion::{Bbr, Cubic, Governor, DEFAULT_MSS};
pub use self::connection::{
    rst_reply, Config, Connection, GovernorKind, Keepalive, Segment, State,
};
