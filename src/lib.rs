//! # flowgate
//!
//! Command dispatcher and workitem queue engine for a workflow automation
//! server.
//!
//! Clients send request envelopes over a persistent connection; the
//! [`dispatch::Dispatcher`] authenticates them, applies admission control,
//! and routes each command to the document store, the workitem queue
//! engine, or the queue namespace guard. Storage, blobs and messaging sit
//! behind traits with in-memory and Postgres (sqlx + pgmq) implementations.

pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod model;
pub mod namespace;
pub mod store;
pub mod telemetry;
pub mod workitem;
