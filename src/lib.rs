//! Stagelight - plugin host for a live-event companion server
//!
//! This library provides the plugin runtime:
//! - Manifest discovery and persisted enable/disable state
//! - A lifecycle manager with batched loading, reload, and delete
//! - A bounded capability surface per plugin (routes, realtime events,
//!   external live events, automation actions, scoped settings)
//! - The HTTP host those capabilities are served from
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Plugins                         │
//! │   Soundboard  │  Overlays  │  Goals  │  ...          │
//! └────────────────────┬────────────────────────────────┘
//!                      │ PluginContext
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Plugin Manager                       │
//! │   Discovery  │  State  │  Lifecycle  │  Event bus    │
//! └────────────────────┬────────────────────────────────┘
//!                      │ HostServices
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Host                              │
//! │   Plugin router │ Realtime │ Live events │ Actions   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod actions;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod live;
pub mod plugins;
pub mod realtime;
pub mod router;
pub mod services;

pub use config::Config;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use plugins::{
    LoadOutcome, LoadSummary, ModuleLoader, ModuleRegistry, Plugin, PluginContext, PluginEvent,
    PluginManager, PluginManifest,
};
pub use router::{PluginRouter, RouteRequest, RouteResponse, StaleRoutePolicy};
pub use services::HostServices;
