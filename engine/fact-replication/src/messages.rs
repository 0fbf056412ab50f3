//! Wire shapes of fact events and the replicated records they produce

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Create,
    Delete,
}

/// Published on `user.events.exchange`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEventMessage {
    pub event_type: EventType,
    pub user_id: Uuid,
    pub email: Option<String>,
    pub full_name: Option<String>,
}

/// Published on `device.events.exchange`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEventMessage {
    pub event_type: EventType,
    pub device_id: Uuid,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
}

impl UserEventMessage {
    pub fn created(user_id: Uuid, email: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Create,
            user_id,
            email: Some(email.into()),
            full_name: Some(full_name.into()),
        }
    }

    pub fn deleted(user_id: Uuid) -> Self {
        Self { event_type: EventType::Delete, user_id, email: None, full_name: None }
    }
}

impl DeviceEventMessage {
    pub fn created(device_id: Uuid, name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Create,
            device_id,
            name: Some(name.into()),
            device_type: Some(device_type.into()),
        }
    }

    pub fn deleted(device_id: Uuid) -> Self {
        Self { event_type: EventType::Delete, device_id, name: None, device_type: None }
    }
}

/// Replicated copy of a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: Uuid,
    pub email: Option<String>,
    pub full_name: Option<String>,
}

/// Replicated copy of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: Uuid,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
}

/// Locally owned association between a user and a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDeviceLink {
    pub user_id: Uuid,
    pub device_id: Uuid,
}

/// A replicated record keyed by the authoritative id
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> Uuid;

    /// Secondary key that must stay unique across records (user email)
    fn unique_key(&self) -> Option<&str> {
        None
    }
}

impl Record for UserRecord {
    fn id(&self) -> Uuid {
        self.id
    }

    fn unique_key(&self) -> Option<&str> {
        self.email.as_deref()
    }
}

impl Record for DeviceRecord {
    fn id(&self) -> Uuid {
        self.id
    }
}

/// Which side of [`UserDeviceLink`] a fact owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSide {
    User,
    Device,
}

/// A fact event as seen by a consumer
pub trait FactMessage: DeserializeOwned + Send + Sync + 'static {
    type Record: Record;

    /// Short domain label used in log lines
    const DOMAIN: &'static str;
    const LINK_SIDE: LinkSide;

    fn event_type(&self) -> EventType;
    fn entity_id(&self) -> Uuid;
    fn to_record(&self) -> Self::Record;
}

impl FactMessage for UserEventMessage {
    type Record = UserRecord;
    const DOMAIN: &'static str = "user";
    const LINK_SIDE: LinkSide = LinkSide::User;

    fn event_type(&self) -> EventType {
        self.event_type
    }

    fn entity_id(&self) -> Uuid {
        self.user_id
    }

    fn to_record(&self) -> UserRecord {
        UserRecord { id: self.user_id, email: self.email.clone(), full_name: self.full_name.clone() }
    }
}

impl FactMessage for DeviceEventMessage {
    type Record = DeviceRecord;
    const DOMAIN: &'static str = "device";
    const LINK_SIDE: LinkSide = LinkSide::Device;

    fn event_type(&self) -> EventType {
        self.event_type
    }

    fn entity_id(&self) -> Uuid {
        self.device_id
    }

    fn to_record(&self) -> DeviceRecord {
        DeviceRecord { id: self.device_id, name: self.name.clone(), device_type: self.device_type.clone() }
    }
}
