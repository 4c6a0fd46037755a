//! murmur-core: packet envelope, wire codec, and configuration.
//! The uplink services and the collector both depend on this crate.

pub mod config;
pub mod wire;

pub use wire::{decode, encode, MalformedPacket, Packet, SequenceId};
