//! Idempotent consumers that keep replicated fact copies in sync.
//!
//! Delivery is at-least-once and unordered across domains, so every decision is made
//! against current local state:
//! - CREATE of a known id is a duplicate, skipped or merged depending on [`ConflictPolicy`]
//! - DELETE of an unknown id is dropped (it may have arrived before its CREATE, or twice)
//! - DELETE cascades to locally owned links before removing the record

use crate::messages::{EventType, FactMessage, LinkSide, Record};
use crate::store::{LinkStore, ReplicaStore};
use crate::Result;
use anyhow::Context;
use fleet_bus::{Delivery, EventBus, MessageHandler, SubscriptionHandle};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

/// What to do when a CREATE arrives for an id that already has a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Leave the existing copy untouched
    Skip,
    /// Overwrite mutable fields with the event's values
    Overwrite,
}

/// Decision taken for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    SkippedDuplicate,
    Deleted { cascaded: usize },
    SkippedMissing,
}

/// Side effect run after a record is inserted or updated
#[async_trait::async_trait]
pub trait ApplyHook<R>: Send + Sync {
    async fn after_upsert(&self, record: &R);
}

pub struct FactConsumer<M: FactMessage> {
    store: Arc<dyn ReplicaStore<M::Record>>,
    links: Option<Arc<dyn LinkStore>>,
    policy: ConflictPolicy,
    hooks: Vec<Arc<dyn ApplyHook<M::Record>>>,
    _message: PhantomData<fn() -> M>,
}

impl<M: FactMessage> FactConsumer<M> {
    pub fn new(store: Arc<dyn ReplicaStore<M::Record>>, policy: ConflictPolicy) -> Self {
        Self { store, links: None, policy, hooks: Vec::new(), _message: PhantomData }
    }

    /// Cascade deletes through these links
    pub fn with_links(mut self, links: Arc<dyn LinkStore>) -> Self {
        self.links = Some(links);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn ApplyHook<M::Record>>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Apply one event to local state
    pub async fn on_event(&self, message: &M) -> Result<ApplyOutcome> {
        match message.event_type() {
            EventType::Create => self.apply_create(message.to_record()).await,
            EventType::Delete => self.apply_delete(message.entity_id()).await,
        }
    }

    async fn apply_create(&self, record: M::Record) -> Result<ApplyOutcome> {
        let id = record.id();

        // A unique key held by another id blocks both insert and overwrite
        if let Some(key) = record.unique_key() {
            if let Some(holder) = self.store.find_by_unique_key(key).await? {
                if holder != id {
                    tracing::info!(
                        "{} with key {} already replicated as {}, skipping event for {}",
                        M::DOMAIN,
                        key,
                        holder,
                        id
                    );
                    return Ok(ApplyOutcome::SkippedDuplicate);
                }
            }
        }

        if self.store.get(id).await?.is_some() {
            return match self.policy {
                ConflictPolicy::Skip => {
                    tracing::info!("{} {} already replicated, skipping duplicate event", M::DOMAIN, id);
                    Ok(ApplyOutcome::SkippedDuplicate)
                }
                ConflictPolicy::Overwrite => {
                    self.store.update(record.clone()).await?;
                    tracing::debug!("{} {} replica overwritten", M::DOMAIN, id);
                    self.run_hooks(&record).await;
                    Ok(ApplyOutcome::Updated)
                }
            };
        }

        self.store.insert(record.clone()).await?;
        tracing::info!("{} {} replicated", M::DOMAIN, id);
        self.run_hooks(&record).await;
        Ok(ApplyOutcome::Inserted)
    }

    async fn apply_delete(&self, id: Uuid) -> Result<ApplyOutcome> {
        if self.store.get(id).await?.is_none() {
            tracing::warn!("{} {} not found, skipping deletion", M::DOMAIN, id);
            return Ok(ApplyOutcome::SkippedMissing);
        }

        let mut cascaded = 0;
        if let Some(links) = &self.links {
            let owned = match M::LINK_SIDE {
                LinkSide::User => links.links_for_user(id).await?,
                LinkSide::Device => links.links_for_device(id).await?,
            };
            for link in owned {
                if links.delete_link(link).await? {
                    cascaded += 1;
                    tracing::debug!(
                        "Deleted user-device link for user {} and device {}",
                        link.user_id,
                        link.device_id
                    );
                }
            }
        }

        self.store.delete(id).await?;
        tracing::info!("{} {} deleted ({} links cascaded)", M::DOMAIN, id, cascaded);
        Ok(ApplyOutcome::Deleted { cascaded })
    }

    async fn run_hooks(&self, record: &M::Record) {
        for hook in &self.hooks {
            hook.after_upsert(record).await;
        }
    }

    /// Start consuming `queue`
    pub async fn bind(self: Arc<Self>, bus: &dyn EventBus, queue: &str) -> Result<SubscriptionHandle> {
        let handle = bus.subscribe(queue, self).await?;
        Ok(handle)
    }
}

#[async_trait::async_trait]
impl<M: FactMessage> MessageHandler for FactConsumer<M> {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
        let message: M = delivery
            .decode()
            .with_context(|| format!("undecodable {} event on {}", M::DOMAIN, delivery.routing_key))?;

        let outcome = self.on_event(&message).await?;
        tracing::debug!("{} event {} applied: {:?}", M::DOMAIN, message.entity_id(), outcome);
        Ok(())
    }
}
