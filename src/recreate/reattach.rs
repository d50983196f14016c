//! Moves the elastic address onto the replacement instance.

use crate::cloud::{AssociateAddress, CloudError, DisassociateAddress, ElasticAddress};

/// Disassociates any live binding, then binds `address` to `instance_id`.
///
/// A binding that vanished in the meantime (the old instance terminated) is
/// not an error. Returns the new association id.
pub(crate) async fn reassociate_address<A>(
    api: &A,
    address: &ElasticAddress,
    instance_id: &str,
) -> Result<String, CloudError>
where
    A: AssociateAddress + DisassociateAddress + Sync,
{
    if let Some(association_id) = address.live_association() {
        match api.disassociate_address(association_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                tracing::debug!(association_id, "association already released");
            }
            Err(err) => return Err(err),
        }
    }
    api.associate_address(&address.allocation_id, instance_id)
        .await
}
