use super::{entity_accessors, HandleCore};
use crate::error::{SyncError, SyncResult};
use weft_protocol::{Data, MessageId, Request, MAX_MESSAGE_BYTES};

/// Fire-and-forget messages to every subscriber. Nothing is stored.
pub struct Stream {
    pub(crate) core: HandleCore,
}

entity_accessors!(Stream);

impl Stream {
    pub(crate) fn new(core: HandleCore) -> Self {
        Self { core }
    }

    /// Publishes a message.
    ///
    /// Messages larger than 4 KiB once serialized are rejected without
    /// contacting the service. Subscribers, including this client, see the
    /// message as a published event.
    pub async fn publish_message(&self, data: Data) -> SyncResult<MessageId> {
        let core = &self.core;
        let op = async move {
            let size = serde_json::to_vec(&data)
                .map_err(|e| SyncError::invalid(e.to_string()))?
                .len();
            if size > MAX_MESSAGE_BYTES {
                return Err(SyncError::invalid(format!(
                    "message of {size} bytes exceeds the {MAX_MESSAGE_BYTES} byte limit"
                )));
            }
            let id = core
                .inner
                .connection
                .request(Request::Publish {
                    entity: core.id,
                    data,
                })
                .await?
                .into_message_id()?;
            Ok(id)
        };
        core.run(op).await
    }
}
