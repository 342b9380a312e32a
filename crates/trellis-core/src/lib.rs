//! Trellis Core Library
//!
//! This crate provides the core functionality for Trellis, a client-side
//! mirror of a server-owned note graph kept consistent over a persistent
//! bidirectional connection.
//!
//! # Architecture
//!
//! - **Mirror graph**: the in-memory copy of notes, branches, and
//!   attributes, mutated only through its merge protocol
//! - **Sync engine**: change-stream consumer, handshake pipeline,
//!   heartbeat supervisor, and conflict reconciler
//!
//! The transport and the surrounding application are collaborators behind
//! traits: a bidirectional message channel, an HTTP-style server API, a
//! user notifier, and an application reloader.
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let api: Arc<dyn ServerApi> = Arc::new(HttpServerApi::new(&config.server_url));
//! let graph = Arc::new(Mutex::new(MirrorGraph::new()));
//! let consumer = Arc::new(ChangeStreamConsumer::new(graph, api, ...));
//! let handle = spawn_supervisor(...);
//! ```
//!
//! # Modules
//!
//! - `graph`: mirror graph and merge protocol
//! - `sync`: the synchronization engine (main entry point)
//! - `api`: server HTTP collaborator
//! - `models`: wire/HTTP data shapes
//! - `session`: protected session gate
//! - `notify`: collaborator traits for notifications and reload
//! - `config`: application configuration

pub mod api;
pub mod config;
pub mod error;
pub mod graph;
pub mod models;
pub mod notify;
pub mod session;
pub mod sync;

pub use api::{HttpServerApi, ServerApi};
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use graph::{Attribute, Branch, MirrorGraph, MirrorHandle, Note, NoteLookup};
pub use models::{AttributeRow, Blob, BranchRow, EntityChange, NoteRow, TreeResponse};
pub use notify::{AppReloader, ConnectionSubscriber, LogNotifier, LogReloader, UserNotifier};
pub use session::{AlreadyFulfilled, Completion, ProtectedSession};
