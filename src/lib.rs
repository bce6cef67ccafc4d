pub mod broker;
pub mod compactor;
pub mod config;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod service;
pub mod wal;
pub mod wire;
