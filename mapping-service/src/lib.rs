//! Dynamic topic mapping.
//!
//! Messages arrive as `(topic, payload)`. Every active rule whose mapping
//! topic covers the topic decodes the payload with its processor, extracts
//! values into a per-message cache, and expands the cache into one or more
//! requests for the target platform.

pub mod admin;
pub mod builtin;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod extension;
pub mod mapping_registry;
pub mod message_id;
pub mod model;
pub mod outbound;
pub mod platform;
pub mod processor;
pub mod publisher;
pub mod status;
pub mod store;
pub mod substitution;
pub mod topic;
pub mod validation;
