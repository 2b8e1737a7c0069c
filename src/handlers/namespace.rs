//! Namespace factory `NamespaceDeployed` events.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::{parse_args, signature_mismatch, ChainEventHandler, Handled, HandlerContext, HandlerError};
use crate::chain::ChainEventEnvelope;

pub const NAMESPACE_DEPLOYED_SIGNATURE: &str =
    "0x8870ba2202802ce285ce6bead5ac915b6dc2d35c8a9d6f96fa56de9de12829d5";

#[derive(Debug, Deserialize)]
struct NamespaceDeployedArgs {
    name: String,
    #[serde(rename = "nameSpaceAddress", alias = "namespaceAddress")]
    namespace_address: String,
}

/// Links a freshly deployed namespace contract to its community.
pub struct NamespaceDeployedHandler {
    ctx: HandlerContext,
}

impl NamespaceDeployedHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChainEventHandler for NamespaceDeployedHandler {
    fn name(&self) -> &'static str {
        "namespace_deployed"
    }

    async fn handle(&self, event: &ChainEventEnvelope) -> Result<Handled, HandlerError> {
        if let Some(skipped) = signature_mismatch(event, NAMESPACE_DEPLOYED_SIGNATURE) {
            return Ok(skipped);
        }
        let args: NamespaceDeployedArgs = parse_args(event)?;
        let address = args.namespace_address.to_lowercase();

        let mut communities = self.ctx.store.communities_by_namespace(&args.name).await?;
        let community = match communities.len() {
            0 => {
                warn!(namespace = %args.name, "No community for deployed namespace");
                return Err(HandlerError::Unresolvable(format!(
                    "no community with namespace {}",
                    args.name
                )));
            }
            1 => communities.remove(0),
            n => {
                return Err(HandlerError::Ambiguous(format!(
                    "{n} communities use namespace {}",
                    args.name
                )));
            }
        };

        if self
            .ctx
            .store
            .link_namespace_address(&community.id, &address)
            .await?
        {
            info!(
                community_id = %community.id,
                namespace = %args.name,
                namespace_address = %address,
                "Namespace address linked"
            );
            return Ok(Handled::Applied);
        }

        match community.namespace_address {
            Some(existing) if existing.eq_ignore_ascii_case(&address) => Ok(Handled::Duplicate),
            Some(existing) => Ok(Handled::Skipped(format!(
                "community {} already linked to {existing}",
                community.id
            ))),
            // Linked between our read and our write.
            None => Ok(Handled::Duplicate),
        }
    }
}
