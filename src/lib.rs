#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: packet dispatch is inherently branchy
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
// Option/Result patterns
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Type defaults
#![allow(clippy::default_trait_access)]
// Unit patterns
#![allow(clippy::ignored_unit_patterns)]
// Closure style
#![allow(clippy::redundant_closure_for_method_calls)]
// Large types
#![allow(clippy::large_enum_variant)]
#![allow(clippy::large_futures)]
// Async functions that may not await yet
#![allow(clippy::unused_async)]
// Explicit returns
#![allow(clippy::needless_return)]
#![allow(clippy::semicolon_if_nothing_returned)]
// Items after statements
#![allow(clippy::items_after_statements)]

//! Stratus - session core of an MQTT 3.1/3.1.1 broker.
//!
//! The crate drives per-client session state machines over three pluggable
//! seams: a pub/sub fabric, a persistence layer, and an authorization
//! handler. The transport listener and wire codec live outside; sessions
//! consume decoded control packets and emit decoded packets back.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::time` - Deterministic time utilities
//!
//! ## Protocol
//! - `protocol` - Decoded MQTT 3.1/3.1.1 control-packet types
//! - `topic` - Topic normalization, filter matching, `$SYS` shielding
//!
//! ## Seams
//! - `fabric` - Pub/sub bus trait and in-memory reference implementation
//! - `persistence` - Retained/offline/session persistence trait and backends
//! - `auth` - Authentication and authorization callbacks
//!
//! ## Runtime
//! - `broker` - Server adapter: client table, dedup source, publish fan-out
//! - `session` - Per-client state machine, forwarder, close coordinator
//! - `events` - Broker lifecycle event stream
//!
//! ## CLI
//! - `cli` - clap entrypoint (`start`, `check`)

pub mod auth;
pub mod broker;
pub mod cli;
pub mod core;
pub mod events;
pub mod fabric;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod topic;

// Re-exports for the common embedding path
pub use self::core::{config, time};
pub use auth::{AllowAll, AuthHandler};
pub use broker::{Broker, BrokerBuilder, ClientPipe, Server};
pub use events::BrokerEvent;
pub use fabric::{Fabric, MemoryFabric};
pub use persistence::{MemoryPersistence, NoopPersistence, Persistence};
pub use protocol::{ControlPacket, Qos};
pub use session::{CloseReason, Session, TransportEvent};
