//! AdaMeter relay.
//!
//! Devices sharing a room connect to `/rooms/<room>` and sync one Automerge
//! document through the relay. The relay never interprets the document; it
//! only stores it and fans changes out.

pub mod server;
