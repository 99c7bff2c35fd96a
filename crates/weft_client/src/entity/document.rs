use super::{entity_accessors, HandleCore};
use crate::dispatcher::EventContext;
use crate::error::{SyncError, SyncResult};
use crate::mutation::{self, Mutation};
use weft_protocol::{Change, Data, Lifetime, Precondition, Request};

/// A single JSON object, replaced or mutated as a whole.
pub struct Document {
    pub(crate) core: HandleCore,
}

entity_accessors!(Document);

impl Document {
    pub(crate) fn new(core: HandleCore) -> Self {
        Self { core }
    }

    /// Returns the latest known data.
    pub fn data(&self) -> Data {
        self.core.cache.read().data.clone()
    }

    /// Replaces the data unconditionally.
    ///
    /// `lifetime`, if given, restarts the document's lifetime.
    pub async fn set_data(&self, data: Data, lifetime: Option<Lifetime>) -> SyncResult<Data> {
        let core = &self.core;
        let op = async move {
            let change = core
                .inner
                .connection
                .request(Request::UpdateDocument {
                    entity: core.id,
                    data,
                    lifetime,
                    precondition: Precondition::None,
                })
                .await?
                .into_change()?;
            core.inner.registry.apply(core.id, &change, EventContext::LOCAL);
            match change {
                Change::DocumentUpdated(snapshot) => Ok(snapshot.data),
                other => Err(SyncError::Generic(format!("unexpected change: {other:?}"))),
            }
        };
        core.run(op).await
    }

    /// Rewrites the data with `mutator`, retrying on concurrent changes.
    ///
    /// The mutator may run several times and must not have side effects.
    /// Returning [`Mutation::Abort`] leaves the document untouched and
    /// resolves with the data the mutator was shown.
    pub async fn mutate_data<F>(&self, mutator: F, lifetime: Option<Lifetime>) -> SyncResult<Data>
    where
        F: FnMut(&Data) -> Mutation + Send,
    {
        let core = &self.core;
        core.run(mutation::mutate_document(
            &core.inner,
            core.id,
            &core.cache,
            mutator,
            lifetime,
        ))
        .await
    }
}
