//! AMQP → WebSocket relay for location-telemetry uplinks.
//!
//! Uplink packets arrive from a fanout exchange, get decoded once, and are
//! fanned out to every connected WebSocket subscriber whose filter matches.
//! Subscribers may pin any of four attributes (`app_id`, `dev_id`,
//! `user_id`, `experiment`) in the `/ws` query string; unset attributes are
//! wildcards.
//!
//! The core is [`hub::Hub`]: a registry of live sessions owned by a single
//! control loop, reached only through channels, with non-blocking delivery
//! and eviction of subscribers that cannot keep up.

pub mod hub;
pub mod ingest;
pub mod message;
pub mod server;
pub mod settings;
pub mod ws;
