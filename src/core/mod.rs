// src/core/mod.rs

//! The central module containing the core logic and data structures of pkgvault.

pub mod cache;
pub mod errors;
pub mod fetch;
pub mod metrics;
pub mod registry;
pub mod resource;

pub use errors::PkgVaultError;
