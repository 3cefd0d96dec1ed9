//! # Juice Core
//!
//! Core traits and types for the Juice reactive state-management
//! architecture.
//!
//! This crate provides the fundamental abstractions for building blocs:
//! addressable units that accept events, run a use case per event, and
//! publish every state transition as a tagged stream status.
//!
//! ## Core Concepts
//!
//! - **Event**: A discriminated input value. Each event carries an explicit
//!   [`Event::Kind`] discriminant used to route it to exactly one use case,
//!   an optional set of [`RebuildGroups`] naming the observers that should
//!   react, and an optional cooperative [`CancelToken`].
//! - **Use case**: A single-purpose handler for one event discriminant,
//!   built fresh per dispatched event ([`UseCase`] / [`UseCaseBuilder`]).
//! - **Context**: The entire surface a use case may touch — state
//!   accessors, the four emit functions, a follow-up `send`, and a
//!   navigation intent ([`UseCaseContext`]).
//! - **Stream status**: The tagged envelope every transition is published
//!   in ([`StreamStatus`]): Updating, Waiting, Failure, or Canceling.
//!
//! ## Architecture Principles
//!
//! - Single-writer state: the only way a transition becomes observable is
//!   through the emit functions on the context.
//! - Explicit discriminants, no reflection: events are routed by an
//!   ordinary `Copy + Eq + Hash` kind value.
//! - Context passed by parameter: use cases never hold late-bound mutable
//!   fields; the context arrives as an immutable argument to `execute`.
//!
//! ## Example
//!
//! ```ignore
//! use juice_core::*;
//!
//! #[derive(Clone, Debug)]
//! enum CounterEvent {
//!     Increment,
//!     Reset,
//! }
//!
//! #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
//! enum CounterEventKind {
//!     Increment,
//!     Reset,
//! }
//!
//! impl Event for CounterEvent {
//!     type Kind = CounterEventKind;
//!
//!     fn kind(&self) -> CounterEventKind {
//!         match self {
//!             Self::Increment => CounterEventKind::Increment,
//!             Self::Reset => CounterEventKind::Reset,
//!         }
//!     }
//! }
//! ```

/// Event model: the [`Event`](event::Event) trait and cooperative
/// cancellation tokens.
pub mod event;

/// Rebuild groups: the observer tag set carried by events and statuses.
pub mod groups;

/// Stream statuses: the tagged envelope wrapping every state transition.
pub mod status;

/// Use-case traits: [`UseCase`](use_case::UseCase), builders, and the
/// execution context surface.
pub mod use_case;

/// Shared error taxonomy.
pub mod error;

pub use error::{EmitError, GroupRuleViolation, UseCaseError};
pub use event::{CancelToken, Event};
pub use groups::{RebuildGroups, WILDCARD_GROUP};
pub use status::StreamStatus;
pub use use_case::{FnUseCaseBuilder, UseCase, UseCaseBuilder, UseCaseContext, use_case_fn};
