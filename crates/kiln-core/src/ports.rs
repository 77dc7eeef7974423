//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external adapters.

use crate::build::{BuildResult, CompletedBuild};
use crate::events::Event;
use crate::ids::{BuilderName, RequestId};
use crate::protocol::AssignFrame;
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `build.*.started`, `worker.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Durable, append-only store for finished builds.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Append a completed build, assigning the next sequence number for its
    /// builder. Fails with `DuplicateAppend` if the request was already
    /// finalized.
    async fn append(&self, build: &CompletedBuild) -> Result<BuildResult>;

    /// Get one build by builder name and sequence number.
    async fn get(&self, builder: &BuilderName, number: u32) -> Result<Option<BuildResult>>;

    /// Most recent build for a builder.
    async fn latest(&self, builder: &BuilderName) -> Result<Option<BuildResult>>;

    /// Recent builds for a builder, newest first.
    async fn list_recent(
        &self,
        builder: &BuilderName,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<BuildResult>>;
}

/// Handle for sending orders to one connected worker.
///
/// Implementations wrap whatever transport the worker is attached over; the
/// dispatcher only ever sees this trait. Sends must not block the caller on
/// the worker actually processing the order.
#[async_trait]
pub trait WorkerLink: Send + Sync {
    /// Send an assignment order.
    async fn assign(&self, order: AssignFrame) -> Result<()>;

    /// Send a cancellation order for an in-flight request.
    async fn cancel(&self, request_id: RequestId) -> Result<()>;
}
