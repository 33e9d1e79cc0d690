use stagehand_core::OwnerId;

use crate::EventEnvelope;

/// Messages that belong to one owner (tenant).
///
/// Transports use this to route (e.g. one pub/sub channel per owner) and
/// subscribers use it to filter a shared stream down to their own user.
pub trait OwnerScoped {
    fn owner_user_id(&self) -> OwnerId;

    fn is_owned_by(&self, owner: OwnerId) -> bool {
        self.owner_user_id() == owner
    }
}

impl<E> OwnerScoped for EventEnvelope<E> {
    fn owner_user_id(&self) -> OwnerId {
        EventEnvelope::owner_user_id(self)
    }
}
