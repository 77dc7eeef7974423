//! Build scheduling.
//!
//! One scheduler, one policy: every accepted change fans out to every
//! configured builder, one request each, whatever the branch. Forced builds
//! go straight to the dispatcher once the builder name checks out.

use crate::dispatch::Dispatcher;
use kiln_core::build::BuildRequest;
use kiln_core::builder::BuilderSet;
use kiln_core::change::Change;
use kiln_core::ids::{BuilderName, RequestId};
use kiln_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Scheduler {
    builders: Arc<BuilderSet>,
    dispatcher: Arc<Dispatcher>,
}

impl Scheduler {
    pub fn new(builders: Arc<BuilderSet>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            builders,
            dispatcher,
        }
    }

    /// Fan an accepted change out to the whole builder set. Returns the
    /// created request ids in builder-name order.
    pub async fn on_change(&self, change: &Change) -> Vec<RequestId> {
        let mut created = Vec::with_capacity(self.builders.len());
        for config in self.builders.iter() {
            let request = BuildRequest::for_change(config.name.clone(), change);
            created.push(self.dispatcher.enqueue(request).await);
        }
        info!(
            change_id = %change.id,
            revision = %change.revision,
            requests = created.len(),
            "change scheduled"
        );
        created
    }

    /// Queue one build of `builder` on behalf of an operator.
    pub async fn force_build(
        &self,
        builder: &BuilderName,
        requested_by: &str,
    ) -> Result<RequestId> {
        if !self.builders.contains(builder) {
            return Err(Error::UnknownBuilder(builder.to_string()));
        }
        let request = BuildRequest::forced(builder.clone(), requested_by);
        debug!(builder = %builder, requested_by, "forced build");
        Ok(self.dispatcher.enqueue(request).await)
    }
}
