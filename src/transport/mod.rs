//! Datagram transport for the session.
//!
//! UDP only: unreliable datagrams, peer address learned from the first
//! inbound packet (and re-learned when the vehicle roams to a new address).

pub mod udp;

pub use udp::UdpLink;
