//! A replicated note store that runs entirely on one machine.
//!
//! One primary process owns the authoritative table and the registry of
//! replicas; any number of replica processes mirror it in memory; protocol
//! gateways front the replicas in three wire formats (HTTP-style, raw TCP
//! envelopes, UDP datagrams). Reads are served from the local replica,
//! writes are forwarded to the primary, and the primary pushes every
//! accepted mutation back out to all replicas before acknowledging the
//! writer. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for the three process roles.
//! - [`record`] holds the note type and the shared JSON payload helpers.
//! - [`request`] normalizes both wire formats into one canonical request
//!   shape and validates it against the `/notes` surface.
//! - [`frame`] assembles complete messages off a socket and encodes the
//!   HTTP-style request and response texts.
//! - [`store`] keeps the primary's table and the replica's cache.
//! - [`upstream`] makes the outbound calls: bootstrap, forward, backup
//!   push, unregister.
//! - [`primary`] serves the authoritative store and coordinates the
//!   sequential replication fan-out.
//! - [`replica`] serves the local mirror over TCP and UDP with a bounded
//!   pool of forwarding workers.
//! - [`gateway`] relays client traffic to a replica it spawns and owns.
//!
//! Integration tests use this crate directly to run a primary and replicas
//! in-process on ephemeral ports.

pub mod cli;
pub mod frame;
pub mod gateway;
pub mod primary;
pub mod record;
pub mod replica;
pub mod request;
pub mod store;
pub mod upstream;
