#![doc = "designsync-core: core pipeline library for designsync."]

//! This crate contains the parts of designsync that decide *whether* work is
//! needed, *how much of it* runs at once and *how to resume* after an
//! interrupted multi-config run. Parsing export configs, talking HTTP and
//! writing output files live in the `designsync` CLI crate, behind the traits
//! in [`contract`].
//!
//! # Usage
//! - [`batch::run_batch`] drives a multi-config run with checkpointing.
//! - [`export::export_config`] runs a single config's units through the change
//!   cache and the shared download queue.
//! - [`processor::process_entries`] is the bounded fan-out used by both.

pub mod batch;
pub mod cache;
pub mod checkpoint;
pub mod context;
pub mod contract;
pub mod error;
pub mod export;
pub mod hasher;
pub mod persist;
pub mod processor;
pub mod queue;
