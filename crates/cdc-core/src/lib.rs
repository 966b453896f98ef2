//! # CDC Core - Change-Data-Capture Core Library
//!
//! This crate provides the foundational types, traits, and abstractions used
//! throughout the CDC replicator. It defines the neutral `Event` wire shape,
//! the pluggable position-tracking subsystem, the transformation rule model,
//! the `Producer`/`Sink` operator traits, the declarative pipeline
//! configuration, and the OIDC token provider contract.
//!
//! ## Key Components
//!
//! - **Event model** ([`event`]): the shape every producer emits and every
//!   sink consumes.
//! - **Position store** ([`position`]): durable per-stream resume cursors,
//!   with a file-backed implementation and a registry for typed decoding.
//! - **Rule model** ([`rule`]): the declarative transformation rules applied
//!   by the transformation engine (implemented in the `cdc-tx` crate).
//! - **Operator traits** ([`operator`]): `Producer` and `Sink`, the seams
//!   implemented by the `cdc-io` crate.
//! - **Configuration** ([`config`]): YAML/JSON pipeline configuration with
//!   environment-variable overlay.
//! - **Auth** ([`auth`]): the OIDC token provider with single-flight
//!   refresh, used by producers and sinks that authenticate with bearer
//!   tokens.
//!
//! ## Example Usage
//!
//! ```rust
//! use cdc_core::{Event, Action};
//!
//! let event = Event::insert("shop", "orders", br#"{"id":1}"#.to_vec());
//! assert_eq!(event.action, Action::Insert);
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod event;
pub mod operator;
pub mod position;
pub mod rule;

pub use auth::{AuthError, CachedToken, TokenCache, TokenProvider, TokenSource};
pub use config::{
    AuthConfig, AuthMethod, LoggingConfig, MetricsConfig, PositionConfig, ReplicatorConfig,
    ServerConfig, SourceConfig, StreamConfig, TargetConfig, TransformationConfig,
};
pub use error::CdcError;
pub use event::{Action, Event, EventError};
pub use operator::{
    EventRx, EventTx, Producer, ProducerMetrics, ProducerState, Sink, SinkError, DEFAULT_CHANNEL_CAPACITY,
};
pub use position::{FilePositionStore, Position, PositionError, PositionRecord, PositionRegistry, PositionStore};
pub use rule::{Action as RuleAction, Condition, ErrorPolicy, ErrorStrategy, Operator as ConditionOperator, Rule};
