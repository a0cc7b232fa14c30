//! # burrow-core
//!
//! Filesystem containment and isolation primitives for rootless containers.
//!
//! This crate provides:
//! - **Guard**: the safe-prefix set every destructive filesystem operation consults.
//! - **File operations**: remove/chown/chmod/temp-file handling gated by the guard.
//! - **Links**: rewriting absolute symlinks between container- and host-rooted forms.
//! - **Resolve**: container-to-host path mapping and executable lookup.
//! - **Namespace**: direct `unshare(2)` requests with a non-Linux fallback.
//! - **Host**: invoking identity, architecture and kernel information.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! `// SAFETY:` documentation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod fileops;
pub mod guard;
pub mod host;
pub mod links;
pub mod namespace;
pub mod resolve;
