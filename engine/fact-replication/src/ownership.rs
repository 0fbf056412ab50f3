//! Device ownership links received from a peer service

use crate::messages::{DeviceRecord, UserDeviceLink, UserRecord};
use crate::propagation::RemotePropagator;
use crate::store::{LinkStore, ReplicaStore};
use crate::Result;
use std::sync::Arc;

/// Result of assigning a device to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    Linked,
    AlreadyLinked,
    UnknownUser,
    UnknownDevice,
}

/// Records user-device links against the local replicas.
///
/// A newly stored link is forwarded to the configured peer. A link the peer already
/// holds comes back as `AlreadyLinked` and is not forwarded again, so two services
/// pointing at each other stop after one round trip.
pub struct OwnershipLinks {
    users: Arc<dyn ReplicaStore<UserRecord>>,
    devices: Arc<dyn ReplicaStore<DeviceRecord>>,
    links: Arc<dyn LinkStore>,
    peer: Option<RemotePropagator>,
}

impl OwnershipLinks {
    pub fn new(
        users: Arc<dyn ReplicaStore<UserRecord>>,
        devices: Arc<dyn ReplicaStore<DeviceRecord>>,
        links: Arc<dyn LinkStore>,
    ) -> Self {
        Self { users, devices, links, peer: None }
    }

    pub fn with_peer(mut self, peer: RemotePropagator) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Link `link.device_id` to `link.user_id`. Both must already be replicated.
    pub async fn assign(&self, link: UserDeviceLink) -> Result<AssignOutcome> {
        if self.users.get(link.user_id).await?.is_none() {
            tracing::warn!("Cannot link device {}: user {} not replicated", link.device_id, link.user_id);
            return Ok(AssignOutcome::UnknownUser);
        }
        if self.devices.get(link.device_id).await?.is_none() {
            tracing::warn!("Cannot link device {}: device not replicated", link.device_id);
            return Ok(AssignOutcome::UnknownDevice);
        }

        if !self.links.insert_link(link).await? {
            tracing::debug!("Device {} already linked to user {}", link.device_id, link.user_id);
            return Ok(AssignOutcome::AlreadyLinked);
        }

        tracing::info!("Linked device {} to user {}", link.device_id, link.user_id);
        if let Some(peer) = &self.peer {
            peer.propagate_link(link).await;
        }
        Ok(AssignOutcome::Linked)
    }
}
