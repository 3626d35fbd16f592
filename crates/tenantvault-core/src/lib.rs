//! Core library for `TenantVault`.
//!
//! Onboards a tenant onto a managed database platform in one run: count the
//! users already in the shared project, provision either a new project or a
//! new user in the shared one through Terraform, then record the resulting
//! credentials with their passwords deterministically encrypted.
//!
//! Persistence goes through the `tenantvault-storage` [`DocumentStore`]
//! trait; this crate knows nothing about specific backends.
//!
//! [`DocumentStore`]: tenantvault_storage::DocumentStore

pub mod atlas;
pub mod capacity;
pub mod error;
pub mod pipeline;
pub mod provisioning;
pub mod recorder;
pub mod vault;
