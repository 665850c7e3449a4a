//! # Sigma — Local Image-Generation Gateway
//!
//! A loopback HTTP service that fronts a remote multimodal image model for a
//! desktop client. It accepts prompts and reference images, runs generation
//! as background tasks (or as a streamed batch), stores results on disk and
//! in an embedded SQLite ledger, and reports quota for the stored token.
//!
//! ## Modules
//!
//! - [`config`] — clap/env startup configuration and the error-message filter
//! - [`port`] — port selection and the port file for client discovery
//! - [`db`] — tasks, history, counter and settings
//! - [`credentials`] — the stored token and its platform binding
//! - [`providers`] — per-platform token probe and balance lookups
//! - [`artifacts`] — generated and reference files on disk
//! - [`urls`] — relative/absolute URL rewriting
//! - [`upstream`] — the generation call and image extraction
//! - [`engine`] — single and batch task orchestration
//! - [`reaper`] — fails tasks stuck in `processing`
//! - [`prom_metrics`] — Prometheus counters and histograms
//! - [`server`] — the axum router and startup sequence

pub mod artifacts;
pub mod config;
pub mod credentials;
pub mod db;
pub mod engine;
pub mod port;
pub mod prom_metrics;
pub mod providers;
pub mod reaper;
pub mod server;
pub mod upstream;
pub mod urls;
