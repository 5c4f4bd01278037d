//! The IPv4 datagram engine.
//!
//! Splits into three concerns: next-hop selection (`route`), fragment reassembly and egress
//! fragmentation (`fragment`), and address translation with connection tracking (`nat`). ICMP
//! error synthesis lives with the interface since it needs the egress path.

mod fragment;
mod nat;
mod route;

pub use self::fragment::{fragments, Fragment, Reassembly};
pub use self::nat::{Nat, Rule};
pub use self::route::{Route, Routes};
