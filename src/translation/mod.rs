//! # Translation Backend
//!
//! Talking to the external services that do the actual translating.
//!
//! ## Key Components:
//! - **Protocol**: backend URL, access token and frame decoding
//! - **Segment**: sentence boundary detection in running transcripts
//! - **Assembler**: turns backend fragments into relay messages
//! - **Connection**: the per-room streaming socket and its reconnect logic
//! - **Reverse**: translating completed messages back for the other speaker

pub mod assembler;
pub mod connection;
pub mod protocol;
pub mod reverse;
pub mod segment;
