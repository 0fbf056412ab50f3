//! HTTP load-balancing proxy.
//!
//! Every request, whatever its method or path, is forwarded to one replica chosen by
//! the [`WeightedSelector`] from a fresh discovery. The replica's status, headers, and
//! body come back unchanged, error statuses included.

use crate::config::BalancerConfig;
use crate::discovery::{authority, ReplicaDiscovery};
use crate::metrics::BalancerMetrics;
use crate::selector::WeightedSelector;
use crate::Result;
use bytes::Bytes;
use http::header::{HeaderName, CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Response, StatusCode};
use hyper::Body;
use std::sync::Arc;
use warp::Filter;

const KEEP_ALIVE: &str = "keep-alive";

pub struct HttpProxy {
    service_name: String,
    replica_port: u16,
    discovery: Arc<dyn ReplicaDiscovery>,
    selector: Arc<WeightedSelector>,
    client: reqwest::Client,
    metrics: Arc<BalancerMetrics>,
}

impl HttpProxy {
    pub fn new(
        config: &BalancerConfig,
        discovery: Arc<dyn ReplicaDiscovery>,
        selector: Arc<WeightedSelector>,
        metrics: Arc<BalancerMetrics>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            service_name: config.service_name.clone(),
            replica_port: config.replica_port,
            discovery,
            selector,
            client,
            metrics,
        })
    }

    /// Forward one request and produce the response for the caller
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response<Body> {
        let replicas = self.discovery.discover().await;
        let Some(replica) = self.selector.select_from(&replicas) else {
            self.metrics.requests_rejected_no_replica.inc();
            tracing::warn!("LoadBalancer has no replicas for {}, rejecting {} {}", self.service_name, method, path);
            return plain_text(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("No replicas available for {}", self.service_name),
            );
        };

        let mut target = format!("http://{}{}", authority(replica, self.replica_port), path);
        if !query.is_empty() {
            target.push('?');
            target.push_str(query);
        }
        tracing::info!("LoadBalancer forwarding {} to {} (weighted selection)", path, replica);

        match self.send(method, &target, headers, body).await {
            Ok(response) => {
                self.metrics.requests_forwarded.inc();
                response
            }
            Err(e) => {
                self.metrics.upstream_failures.inc();
                tracing::error!("LoadBalancer failed to forward to {}: {}", target, e);
                plain_text(StatusCode::BAD_GATEWAY, format!("Load Balancer Error: {}", e))
            }
        }
    }

    async fn send(
        &self,
        method: Method,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Body>> {
        let mut forwarded = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            if name != HOST {
                forwarded.append(name.clone(), value.clone());
            }
        }

        let upstream = self.client.request(method, target).headers(forwarded).body(body).send().await?;

        let status = upstream.status();
        let upstream_headers = upstream.headers().clone();
        let payload = upstream.bytes().await?;

        let mut builder = Response::builder().status(status);
        for (name, value) in upstream_headers.iter() {
            if !is_hop_by_hop(name) {
                builder = builder.header(name, value);
            }
        }
        Ok(builder.body(Body::from(payload))?)
    }
}

/// Headers describing the upstream connection rather than the payload
fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == CONNECTION || name == TRANSFER_ENCODING || name.as_str() == KEEP_ALIVE
}

fn plain_text(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Catch-all route forwarding every request through `proxy`
pub fn create_routes(
    proxy: Arc<HttpProxy>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let proxy_filter = warp::any().map(move || proxy.clone());
    let raw_query = warp::query::raw().or(warp::any().map(String::new)).unify();

    warp::method()
        .and(warp::path::full())
        .and(raw_query)
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and(proxy_filter)
        .and_then(
            |method: Method,
             path: warp::path::FullPath,
             query: String,
             headers: HeaderMap,
             body: Bytes,
             proxy: Arc<HttpProxy>| async move {
                Ok::<_, warp::Rejection>(proxy.forward(method, path.as_str(), &query, headers, body).await)
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::selector::DEFAULT_WEIGHTS;
    use std::net::SocketAddr;

    /// Upstream that echoes what it received and answers 201 with a custom header
    fn spawn_echo_replica() -> SocketAddr {
        let route = warp::method()
            .and(warp::path::full())
            .and(warp::query::raw().or(warp::any().map(String::new)).unify())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .map(|method: Method, path: warp::path::FullPath, query: String, headers: HeaderMap, body: Bytes| {
                let echo = serde_json::json!({
                    "method": method.as_str(),
                    "path": path.as_str(),
                    "query": query,
                    "host": headers.get(HOST).and_then(|v| v.to_str().ok()),
                    "trace": headers.get("x-trace-id").and_then(|v| v.to_str().ok()),
                    "body": String::from_utf8_lossy(&body),
                });
                let reply = warp::reply::with_header(warp::reply::json(&echo), "x-replica", "echo");
                warp::reply::with_status(reply, StatusCode::CREATED)
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    fn create_test_proxy(replicas: Vec<String>, port: u16) -> (Arc<HttpProxy>, Arc<BalancerMetrics>) {
        let config = BalancerConfig { replica_port: port, upstream_timeout_ms: 2000, ..BalancerConfig::default() };
        let metrics = Arc::new(BalancerMetrics::new());
        let proxy = HttpProxy::new(
            &config,
            Arc::new(StaticDiscovery::new(replicas)),
            Arc::new(WeightedSelector::with_seed(DEFAULT_WEIGHTS.to_vec(), 1)),
            metrics.clone(),
        )
        .unwrap();
        (Arc::new(proxy), metrics)
    }

    #[tokio::test]
    async fn test_request_is_forwarded_verbatim() {
        let addr = spawn_echo_replica();
        let (proxy, metrics) = create_test_proxy(vec!["127.0.0.1".to_string()], addr.port());
        let routes = create_routes(proxy);

        let response = warp::test::request()
            .method("POST")
            .path("/energy-consumption/daily?deviceId=abc&date=2024-01-15")
            .header("host", "client.example")
            .header("x-trace-id", "t-1")
            .body("payload")
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-replica"], "echo");
        let echo: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(echo["method"], "POST");
        assert_eq!(echo["path"], "/energy-consumption/daily");
        assert_eq!(echo["query"], "deviceId=abc&date=2024-01-15");
        assert_eq!(echo["trace"], "t-1");
        assert_eq!(echo["body"], "payload");
        assert_ne!(echo["host"], "client.example");
        assert_eq!(metrics.requests_forwarded.get(), 1);
    }

    #[tokio::test]
    async fn test_no_replicas_is_503() {
        let (proxy, metrics) = create_test_proxy(Vec::new(), 8080);
        let routes = create_routes(proxy);

        let response = warp::test::request().path("/anything").reply(&routes).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body().as_ref(), b"No replicas available for monitoring-microservice");
        assert_eq!(metrics.requests_rejected_no_replica.get(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_replica_is_502() {
        let (proxy, metrics) = create_test_proxy(vec!["127.0.0.1".to_string()], 1);
        let routes = create_routes(proxy);

        let response = warp::test::request().path("/health").reply(&routes).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(String::from_utf8_lossy(response.body()).starts_with("Load Balancer Error:"));
        assert_eq!(metrics.upstream_failures.get(), 1);
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop(&CONNECTION));
        assert!(is_hop_by_hop(&HeaderName::from_static("keep-alive")));
        assert!(!is_hop_by_hop(&http::header::CONTENT_TYPE));
    }
}
