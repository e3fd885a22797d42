// Fleet Orchestrator Server
// This contains the HTTP surface that exposes the engine

//! # Fleet Orchestrator Server Module
//!
//! This module exposes the orchestration engine over HTTP. The server layer
//! sits on top of the engine layer and adds no behaviour of its own.
//!
//! ## Server Architecture
//!
//! ```text
//! Operators (admin CLI, UI)        Agents
//!        ↓ /api/...                  ↓ /agent/:client_id/...
//! Server Layer (this module) ← JSON over HTTP, CORS
//!        ↓ Function calls
//! Engine Layer ← runner, hunts, stores
//!        ↓ Function calls
//! Domain Layer ← flows, envelopes, hunts
//! ```
//!
//! ## Endpoints
//!
//! | Method | Path                                  | Purpose                    |
//! |--------|---------------------------------------|----------------------------|
//! | GET    | `/health`                             | liveness                   |
//! | POST   | `/api/flows`                          | start a flow               |
//! | GET    | `/api/flows?session_id=`              | read a flow                |
//! | POST   | `/api/flows/cancel`                   | cancel a flow              |
//! | GET    | `/api/clients/:client_id/flows`       | flows of a client          |
//! | GET    | `/api/clients/:client_id/crashes`     | crash history of a client  |
//! | POST   | `/api/hunts`                          | start a hunt               |
//! | GET    | `/api/hunts/:hunt_id`                 | hunt and statistics        |
//! | POST   | `/api/hunts/:hunt_id/clients`         | add clients                |
//! | POST   | `/api/hunts/:hunt_id/tick`            | dispatch the next window   |
//! | POST   | `/api/hunts/:hunt_id/pause`           | pause                      |
//! | POST   | `/api/hunts/:hunt_id/resume`          | resume                     |
//! | POST   | `/api/hunts/:hunt_id/stop`            | stop                       |
//! | POST   | `/agent/:client_id/messages`          | inbound envelopes          |
//! | GET    | `/agent/:client_id/requests?max=N`    | drain outbound requests    |
//!
//! ## Rust Learning Notes:
//!
//! ### Errors as Responses
//! Handlers return `Result<Json<T>, ApiError>`. `ApiError` implements
//! `IntoResponse`, so `?` on any `FleetError` turns into a JSON error body with
//! the matching status code.
//!
//! ### State Extraction
//! `FleetEngine` is `Clone` (every component sits behind an `Arc`), which is
//! all axum needs for `State<FleetEngine>`.

/// Axum-based HTTP server
///
/// Contains:
/// - Route table and handlers
/// - `FleetError` to status code mapping
/// - Builder pattern for server configuration
pub mod http;

pub use http::{routes, ApiError, HttpServer, HttpServerBuilder};
