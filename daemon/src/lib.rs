// Agreement bot daemon library
// Exposes internal modules for the agbot binary and for testing

#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod ledger;
pub mod locks;
pub mod pattern_manager;
pub mod registry;
pub mod router;
pub mod store;
pub mod sweeps;
pub mod worker;
