//! Workspace facade crate.
//!
//! Host applications depend on `offline-sync-workspace` and get the fully wired
//! [`CoreService`] plus the building blocks it is made of, without naming each
//! workspace crate individually.

#[cfg(feature = "desktop-shims")]
pub use core_service::*;
