//! # burrow-runtime
//!
//! Turns a container bundle and a set of run options into a supervised
//! process.
//!
//! - **Spec**: typed OCI runtime spec and the builder that mutates it per run.
//! - **Engine**: the [`engine::ExecutionEngine`] trait with a namespace
//!   runtime variant (runc/crun) and a syscall-emulation variant (`PRoot`).
//! - **Supervisor**: interactive and pty-streamed child supervision.
//! - **File binding**: per-run host copies of system files bound into the
//!   container.
//! - **Store**: container directories, metadata, execution mode and links.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod env;
pub mod error;
pub mod filebind;
pub mod gpu;
pub mod spec;
pub mod store;
pub mod supervisor;
