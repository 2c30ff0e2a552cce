//! # Ripple Services
//!
//! The three services that share the consistency layer, each at its
//! boundary only:
//!
//! - [`content`]: owns content, validates and commits writes, emits events
//!   and invalidates its caches
//! - [`search`]: derives a search read model from content events
//! - [`media`]: owns uploaded media and deletes what deleted content left behind
//! - [`admission`]: IP-keyed request and registration gates
//! - [`config`]: environment configuration for a node
//! - [`app`]: wires one role into a running node
//!
//! HTTP routing, authentication and database schemas are outside this
//! crate; services take an already authenticated actor id.

pub mod admission;
pub mod app;
pub mod config;
pub mod content;
pub mod media;
pub mod search;

pub use app::{Collaborators, NodeError, RippleNode, RoleService, Shared};
pub use config::{Config, ConfigError, ServiceRole};
