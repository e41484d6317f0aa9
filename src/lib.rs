//! Resilient CRM API Client Library
//!
//! This library wraps a rate-limited CRM REST API with local rate limiting,
//! response classification, bounded retries, request analytics and a
//! composite health check. All cross-invocation state is kept in a pluggable
//! state store, so the client works the same in a long-running service and
//! in one-shot invocations.
//!
//! # Modules
//!
//! - `api`: HTTP surface of the ops service.
//! - `core`: Domain types, errors and resilience policies.
//! - `integrations`: CRM client.
//! - `analytics`: Request analytics and connection quality.
//! - `cache_validator`: Checksummed state entries.
//! - `circuit_breaker`: Circuit breaker for the Postgres state store.
//! - `classifier`: Response classification.
//! - `config`: Configuration management.
//! - `db`: Database connection and pool management.
//! - `db_storage`: Postgres state store.
//! - `diagnostics`: Operator diagnostics snapshot.
//! - `errors`: Error handling types.
//! - `gateway_client`: CRM client and request dispatcher.
//! - `handlers`: HTTP request handlers.
//! - `health`: Health checks and history.
//! - `models`: Core data models.
//! - `rate_limiter`: Fixed-window rate limiting.
//! - `retry`: Retry policy.
//! - `state_store`: State store trait and in-process backend.

pub mod api;
pub mod core;
pub mod integrations;

pub mod analytics;
pub mod cache_validator;
pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod diagnostics;
pub mod errors;
pub mod gateway_client;
pub mod handlers;
pub mod health;
pub mod models;
pub mod rate_limiter;
pub mod retry;
pub mod state_store;
