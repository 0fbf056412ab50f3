//! Best-effort HTTP replication to a peer service

use crate::config::PropagationConfig;
use crate::consumer::ApplyHook;
use crate::messages::{UserDeviceLink, UserRecord};
use crate::{ReplicationError, Result};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct UserIdBody {
    id: Uuid,
}

/// Pushes locally applied facts to a peer over HTTP.
///
/// Failures (transport or non-2xx) are logged at warn and swallowed. Nothing is
/// retried or queued; the peer is expected to catch up from its own bus queue.
#[derive(Debug, Clone)]
pub struct RemotePropagator {
    base_url: String,
    client: reqwest::Client,
}

impl RemotePropagator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url: base_url.into().trim_end_matches('/').to_string(), client })
    }

    /// Build from config; `None` when no peer is configured
    pub fn from_config(config: &PropagationConfig) -> Result<Option<Self>> {
        match &config.base_url {
            Some(url) if !url.is_empty() => {
                Ok(Some(Self::new(url.clone(), Duration::from_millis(config.timeout_ms))?))
            }
            _ => Ok(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST {base}/users` with `{"id": ...}`
    pub async fn propagate_user(&self, user_id: Uuid) {
        let url = format!("{}/users", self.base_url);
        match self.post(&url, &UserIdBody { id: user_id }).await {
            Ok(()) => tracing::info!("RemotePropagator replicated user {} to {}", user_id, url),
            Err(e) => tracing::warn!("RemotePropagator failed to replicate user {}: {}", user_id, e),
        }
    }

    /// `POST {base}/device-owner-link` with `{"userId": ..., "deviceId": ...}`
    pub async fn propagate_link(&self, link: UserDeviceLink) {
        let url = format!("{}/device-owner-link", self.base_url);
        match self.post(&url, &link).await {
            Ok(()) => tracing::info!(
                "RemotePropagator linked device {} to user {}",
                link.device_id,
                link.user_id
            ),
            Err(e) => tracing::warn!(
                "RemotePropagator failed to link device {} to user {}: {}",
                link.device_id,
                link.user_id,
                e
            ),
        }
    }

    async fn post<T: Serialize>(&self, url: &str, body: &T) -> Result<()> {
        let response = self.client.post(url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(ReplicationError::PeerRejected {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ApplyHook<UserRecord> for RemotePropagator {
    async fn after_upsert(&self, record: &UserRecord) {
        self.propagate_user(record.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use warp::Filter;

    /// Spawn a peer that records POST bodies and answers with `status`
    async fn spawn_peer(status: u16) -> (String, Arc<Mutex<Vec<(String, serde_json::Value)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let route = warp::post()
            .and(warp::path::full())
            .and(warp::body::json())
            .map(move |path: warp::path::FullPath, body: serde_json::Value| {
                captured.lock().unwrap().push((path.as_str().to_string(), body));
                warp::reply::with_status(
                    "",
                    warp::http::StatusCode::from_u16(status).unwrap(),
                )
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        (format!("http://{}", addr), seen)
    }

    #[tokio::test]
    async fn test_propagate_user_posts_id() {
        let (base, seen) = spawn_peer(201).await;
        let propagator = RemotePropagator::new(format!("{}/", base), Duration::from_secs(2)).unwrap();
        let id = Uuid::new_v4();

        propagator.propagate_user(id).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "/users");
        assert_eq!(seen[0].1, serde_json::json!({"id": id}));
    }

    #[tokio::test]
    async fn test_propagate_link_uses_camel_case() {
        let (base, seen) = spawn_peer(200).await;
        let propagator = RemotePropagator::new(base, Duration::from_secs(2)).unwrap();
        let link = UserDeviceLink { user_id: Uuid::new_v4(), device_id: Uuid::new_v4() };

        propagator.propagate_link(link).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "/device-owner-link");
        assert_eq!(seen[0].1, serde_json::json!({"userId": link.user_id, "deviceId": link.device_id}));
    }

    #[tokio::test]
    async fn test_rejection_and_unreachable_peer_are_swallowed() {
        let (base, _seen) = spawn_peer(500).await;
        let propagator = RemotePropagator::new(base, Duration::from_secs(2)).unwrap();
        propagator.propagate_user(Uuid::new_v4()).await;

        let err = propagator.post(&format!("{}/users", propagator.base_url()), &UserIdBody { id: Uuid::nil() }).await;
        assert!(matches!(err, Err(ReplicationError::PeerRejected { status: 500, .. })));

        let unreachable = RemotePropagator::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        unreachable.propagate_user(Uuid::new_v4()).await;
    }

    #[test]
    fn test_from_config_disabled_without_url() {
        assert!(RemotePropagator::from_config(&PropagationConfig::default()).unwrap().is_none());
    }
}
