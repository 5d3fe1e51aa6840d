//! ==============================================================================
//! field-node - on-device runtime for a field sensor node
//! ==============================================================================
//!
//! purpose:
//!     keeps a small sensor node registered with the ledger, discovers the
//!     sensors plugged into it, and serves the measurement requirements of the
//!     assets near it. readings that cannot be posted are queued on disk and
//!     replayed once the ledger is reachable again.
//!
//! layout:
//!     - device.rs / module.rs: shared device context and the module lifecycle
//!     - lifecycle.rs, cache_manager.rs, observer.rs, operator.rs,
//!       failover.rs, hotswap.rs, commands.rs: the modules
//!     - engine.rs, sensors/, scanner.rs, hal.rs: reading and discovery
//!     - events.rs, cache.rs, identity.rs, store.rs, ledger/: plumbing
//!
//! ==============================================================================

pub mod cache;
pub mod cache_manager;
pub mod commands;
pub mod config;
pub mod device;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod failover;
pub mod hal;
pub mod hotswap;
pub mod identity;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod module;
pub mod observer;
pub mod operator;
pub mod scanner;
pub mod sensors;
pub mod store;
