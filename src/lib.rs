//! # Datagate
//!
//! The control plane for shared analytical PostgreSQL warehouses, usable both
//! as a standalone binary and as a library. It reconciles per-user database
//! grants against a dataset catalog, issues short-lived login credentials,
//! and streams catalog-authorized SQL queries to users as CSV.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! datagate = { version = "0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use datagate::catalog::{SqliteStore, Store};
//! use datagate::config::Settings;
//! use datagate::lock::StoreLock;
//! use datagate::pg::TokioPgConnector;
//! use datagate::publish::CredentialPublisher;
//! use datagate::reconcile::Reconciler;
//! use datagate::server::{AppState, create_router};
//!
//! let settings = Arc::new(Settings::load("datagate.toml")?);
//! let store: Arc<dyn Store> = Arc::new(SqliteStore::new(settings.db_path())?);
//! store.initialize()?;
//!
//! let lock = Arc::new(StoreLock::new(store.clone()));
//! let reconciler = Reconciler::new(settings.clone(), store.clone(), lock, Arc::new(TokioPgConnector));
//! let publisher = CredentialPublisher::new(settings.notebooks_bucket.clone()).await;
//!
//! let router = create_router(Arc::new(AppState { settings, store, reconciler, publisher }));
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Includes the binary's CLI. Disable with `default-features = false`.

pub mod audit;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod error;
pub mod identity;
pub mod lock;
pub mod pg;
pub mod publish;
pub mod reconcile;
pub mod server;
pub mod stream;
pub mod types;
