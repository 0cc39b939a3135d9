use crate::{command::ServiceInstance, rpc::envelope::RpcRequest};

/// One routing stage: narrows the discovered candidate set before load
/// balancing. Stages run in the order they were added to the client; a stage
/// that returns an empty set ends the call with a routing failure.
pub trait Router: Send + Sync + 'static {
    fn route(&self, candidates: Vec<ServiceInstance>, request: &RpcRequest) -> Vec<ServiceInstance>;
}

/// Matches a request attachment against instance metadata: when the request
/// carries `attachment_key`, only instances whose metadata at `metadata_key`
/// equals that value survive. Requests without the attachment pass through
/// untouched.
pub struct TagRouter {
    attachment_key: String,
    metadata_key: String,
}

impl TagRouter {
    pub fn new(attachment_key: impl Into<String>, metadata_key: impl Into<String>) -> Self {
        Self {
            attachment_key: attachment_key.into(),
            metadata_key: metadata_key.into(),
        }
    }
}

impl Default for TagRouter {
    fn default() -> Self {
        Self::new("tag", "tag")
    }
}

impl Router for TagRouter {
    fn route(&self, candidates: Vec<ServiceInstance>, request: &RpcRequest) -> Vec<ServiceInstance> {
        let Some(wanted) = request.attachments.get(&self.attachment_key) else {
            return candidates;
        };
        candidates
            .into_iter()
            .filter(|instance| instance.metadata.get(&self.metadata_key) == Some(wanted))
            .collect()
    }
}
