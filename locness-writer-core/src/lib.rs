#![doc = "locness-writer-core: core logic library for locness-writer."]

//! This crate holds the store-agnostic pipeline of locness-writer: polling a
//! record store past a watermark, grouping records into hourly buckets and
//! replace-publishing each bucket as a CSV file.
//! Vendor adapters (DynamoDB, Google Drive) live in the `locness-writer` crate
//! and plug in through the traits in [`contract`].
//!
//! # Usage
//! Build a [`synchronise::SyncState`] from a [`config::Config`], then either call
//! [`synchronise::run_cycle`] directly or hand everything to a
//! [`scheduler::Scheduler`].

pub mod batch;
pub mod config;
pub mod contract;
pub mod csv;
pub mod fetch;
pub mod record;
pub mod retry;
pub mod scheduler;
pub mod synchronise;
pub mod watermark;
