//! REST API over the `ceph` CLI: CephFS provisioning with rollback, CephX
//! auth entities, snapshot schedules, OSD flags and cluster status.

pub mod access;
pub mod api;
pub mod audit;
pub mod cache;
pub mod cephx;
pub mod classify;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod filesystem;
pub mod osd;
pub mod probes;
pub mod provision;
pub mod security;
pub mod snapshot;
pub mod validation;

#[cfg(test)]
mod testing;

pub use api::CephApi;
pub use config::ApiConfig;
pub use error::{ApiError, ApiResult, CephError, CephResult};
pub use executor::{CephClient, CephCommand, ProcessOutput, ProcessRunner, RunnerError};
