// Device Administration Engine
// Shared modules for the CLI, background workers and tests

#![warn(missing_docs)]

//! Configuration transaction and reconfiguration engine for the device's
//! web-based administration backend
//!
//! Form submissions are validated and applied to the device's flat-file
//! configuration; OS side effects run through a [`exec::CommandRunner`] and
//! anything that outlives a request is handed to a detached worker.
//!
//! # Main Components
//!
//! - [`codec`]: Quoted, shell and tagged-line file dialects; privileged publish
//! - [`network`]: Interface stanza and resolver file, address validation
//! - [`firewall`]: Policy and rule store with staged edits and script generation
//! - [`bridge`]: Bridge/STP settings and their validation
//! - [`reconfigure`]: Interface down, rewrite, up sequence
//! - [`firmware`]: Detached flashing, completion polling and reboot
//! - [`flags`], [`transaction`]: Unsaved-settings tracking, commit and rollback
//! - [`store`]: Per-request context tying paths, runner and background together

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod firmware;
pub mod flags;
pub mod form;
pub mod network;
pub mod reconfigure;
pub mod settings;
pub mod store;
pub mod transaction;
pub mod types;
