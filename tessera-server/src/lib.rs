//! # tessera-server: Screen-Sharing Server
//!
//! Accepts viewer connections over TCP and streams tiled display
//! updates to them using `tessera-core`. Displays are synthetic test
//! patterns; viewer input is logged rather than injected.
//!
//! ## Modules
//!
//! - **config**: TOML configuration with defaults for every section.
//! - **displays**: animated in-memory displays.
//! - **service**: listener, session spawning and shutdown.

pub mod config;
pub mod displays;
pub mod service;
