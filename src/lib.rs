//! Meridian DNS Server
//!
//! A modular authoritative and forwarding DNS server. The server is
//! assembled at runtime from a JSON configuration: every app, query handler
//! and log handler is a registered module, and handler trees are built by
//! the module loader from nested configuration fragments.
//!
//! # Features
//!
//! * Authoritative forward zones with zone scoped upstream fallback
//! * Transparent forwarding to upstream resolvers over UDP, TCP and TLS
//! * Client classification by source IP and CIDR groups
//! * Policy routing: per client-group handler subtrees derived by
//!   selective configuration override
//! * Pluggable text and JSON log output
//!
//! # Architecture
//!
//! * `module` - module registry, loader and the handler tree contracts
//! * `dns` - protocol handling, zones, resolvers and the server host
//! * `config` - root configuration and generation lifecycle
//! * `logging` - log setup and log handler modules

/// DNS protocol handling, zones, resolvers and the server host
pub mod dns;

/// Module registry, loader and handler tree contracts
pub mod module;

/// Root configuration loading and the generation lifecycle
pub mod config;

/// Log setup and the pluggable log handler modules
pub mod logging;
