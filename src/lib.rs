//! A user-level TCP/IPv4 network stack for bare-metal environments.
//!
//! `ustack` parses and builds every frame from Ethernet upward and drives a full TCP connection
//! state machine (retransmission, flow control, congestion control, teardown) on top of IPv4
//! framing, ARP resolution, fragment reassembly and static routing. It assumes no operating
//! system networking whatsoever: the only thing the environment must supply is a [`nic::Device`]
//! that moves raw Ethernet frames, and a periodic call to [`stack::Interface::tick`].
//!
//! ## Structure
//!
//! * [`wire`]: stateless parse/build for Ethernet, ARP, IPv4, ICMPv4, UDP and TCP, plus the
//!   RFC 1071 checksum. Pure transforms between byte buffers and `Repr` records.
//! * [`layer`]: the stateful machinery. ARP resolver, routing table, fragment reassembly, NAT,
//!   and the TCP connection state machine with its congestion governors.
//! * [`socket`]: the user-facing socket demultiplexer. bind/listen/connect/send/recv/close and
//!   raw UDP inboxes for protocol collaborators.
//! * [`nic`]: the device boundary, with a software [`nic::Loopback`] fallback.
//! * [`stack`]: an explicit [`stack::Interface`] context object owning all tables. There is no
//!   global state; tests construct as many independent stacks as they need.
//!
//! ## Concurrency model
//!
//! The engine is single-threaded and cooperative. Ingress frames are drained synchronously via
//! [`stack::Interface::poll`], and all timers run from an explicit [`stack::Interface::tick`]
//! that callers invoke at a fixed nominal frequency (see [`time::TICK_HZ`]). Blocking socket
//! calls are poll-drain loops with a tick deadline. Nothing here is `Sync`; an environment with a
//! genuinely concurrent ingress interrupt must serialize access to the stack context itself.
#![warn(unreachable_pub)]
// tests should be able to use `std`
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

#[macro_use]
mod macros;

pub mod layer;
pub mod nic;
pub mod socket;
pub mod stack;
pub mod time;
pub mod wire;
