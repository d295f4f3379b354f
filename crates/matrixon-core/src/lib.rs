//! Matrixon Core Library
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.11.0-alpha
//! Date: 2024-03-21
//!
//! Fundamental types and traits for Matrixon's gap detection and
//! missing-state resolution engine.
//!
//! # Features
//! - Content-addressed room events (`PduEvent`, `PduBuilder`)
//! - State snapshots and ingestion inputs
//! - Collaborator traits for federation, local graph, signatures,
//!   ingestion, state resolution and authorisation
//! - Deterministic event orderings
//! - Request deadlines and configuration types
//!
//! # Examples
//! ```rust
//! use matrixon_core::{pdu::PduBuilder, Result};
//! use ruma::{events::TimelineEventType, owned_room_id, owned_user_id};
//!
//! fn example() -> Result<()> {
//!     let create = PduBuilder::new(
//!         owned_room_id!("!room:example.com"),
//!         owned_user_id!("@alice:example.com"),
//!         TimelineEventType::RoomCreate,
//!         serde_json::json!({ "creator": "@alice:example.com" }),
//!     )
//!     .state_key("")
//!     .build()?;
//!     assert!(create.is_create());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod ordering;
pub mod pdu;
pub mod traits;
pub mod types;
pub mod utils;

pub use config::{GapResolutionConfig, LoggingConfig};
pub use matrixon_common::{MatrixonError, Result};
pub use pdu::{PduBuilder, PduEvent};
pub use traits::{
    AuthFailure, EventAuthorizer, FederationGateway, IngestionSink, LocalGraph,
    SignatureVerifier, StateResolver,
};
pub use types::{
    InputKind, InputRoomEvent, MissingEventsOutcome, MissingEventsRequest, MissingStateOutcome,
    Rejection, RemoteState, ResolvedState, SnapshotKnowledge, StateAfterEvents, StateIds,
};
pub use utils::Deadline;
