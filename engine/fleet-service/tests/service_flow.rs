//! Whole-process run in memory: replication, routing, aggregation and alerts

use chrono::NaiveDate;
use energy_monitor::realtime::device_notification_topic;
use energy_monitor::MeasurementMessage;
use fact_replication::{FactPublisher, ReplicaStore};
use fleet_bus::topology::{DEVICE_MEASUREMENTS_EXCHANGE, DEVICE_MEASUREMENT_KEY};
use fleet_bus::{publish_json, InMemoryBus};
use fleet_service::{ServiceConfig, ServiceRole, ServiceState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn create_test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.balancer.listen_addr = "127.0.0.1:0".to_string();
    config.balancer.static_replicas = Some(vec!["127.0.0.1".to_string()]);
    config.monitor.rest_listen_addr = "127.0.0.1:0".to_string();
    config.monitor.threshold = 20.0;
    config.metrics.enabled = false;
    config
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_all_roles_process_measurements_end_to_end() {
    let state = Arc::new(ServiceState::new(create_test_config(), ServiceRole::All).await.unwrap());
    state.start_consumers().await.unwrap();

    let device_id = Uuid::new_v4();
    let publisher = FactPublisher::new(state.bus.clone());
    publisher.publish_device_created(device_id, "Dryer", "appliance").await;

    {
        let state = state.clone();
        wait_until(move || {
            let state = state.clone();
            async move { state.devices.get(device_id).await.unwrap().is_some() }
        })
        .await;
    }

    let mut alerts = state.hub.subscribe(&device_notification_topic(device_id));
    let day = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
    for (minute, value) in [(0, 12.0), (30, 9.5)] {
        let message = MeasurementMessage {
            timestamp: day.and_hms_opt(14, minute, 0).unwrap(),
            device_id,
            measurement_value: value,
        };
        publish_json(state.bus.as_ref(), DEVICE_MEASUREMENTS_EXCHANGE, DEVICE_MEASUREMENT_KEY, &message)
            .await
            .unwrap();
    }

    {
        let state = state.clone();
        wait_until(move || {
            let state = state.clone();
            async move { state.monitor_metrics.measurements_processed.get() == 2 }
        })
        .await;
    }

    // Every in-process replica queue has a listener, so nothing is stranded
    assert_eq!(state.balancer_metrics.routed_total(), 2);

    let daily = state.aggregator.daily_consumption(device_id, day).await.unwrap();
    assert_eq!(daily.total_consumption, 21.5);

    let alert = tokio::time::timeout(Duration::from_secs(3), alerts.recv()).await.unwrap().unwrap();
    assert_eq!(alert["deviceName"], "Dryer");
    assert_eq!(alert["currentConsumption"], 21.5);

    state.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_monitoring_rest_api_serves_health() {
    let bus = Arc::new(InMemoryBus::new());
    let state = ServiceState::with_bus(create_test_config(), ServiceRole::Monitoring, bus).await.unwrap();
    let (bound, tasks) = state.start_http_servers().await.unwrap();
    assert!(bound.balancer.is_none());
    let addr = bound.monitor.unwrap();

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");

    state.shutdown().await.unwrap();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_balancer_proxies_to_in_process_replica() {
    let state = ServiceState::new(create_test_config(), ServiceRole::All).await.unwrap();
    let (bound, tasks) = state.start_http_servers().await.unwrap();
    let balancer = bound.balancer.unwrap();

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", balancer))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");

    state.shutdown().await.unwrap();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
