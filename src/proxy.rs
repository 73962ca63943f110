use crate::config::Config;
use crate::content::{home_page, ContentStore};
use crate::error::{json_error_response, ForwardError, GatewayErrorCode};
use crate::healthcheck::{HealthChecker, RetryPolicy};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::process::ProcessSupervisor;
use crate::registry::{Registry, ServiceId};
use crate::restart::RestartController;
use crate::routes::{Route, RouteTable, RouteTarget};
use crate::status::StatusAggregator;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Headers accepted on cross-origin requests
const ALLOWED_HEADERS: &str = "Content-Type, Authorization";

type GatewayResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Shared state behind every connection: routing, forwarding and the
/// components the local endpoints report on
pub struct Gateway {
    registry: Arc<Registry>,
    routes: RouteTable,
    pool: Arc<ConnectionPool>,
    checker: Arc<HealthChecker>,
    supervisor: Arc<ProcessSupervisor>,
    restarts: Arc<RestartController>,
    status: StatusAggregator,
    content: ContentStore,
    home: Bytes,
    allowed_origin: HeaderValue,
    request_timeout: Duration,
    probe_timeout: Duration,
    probe_before_forward: bool,
}

impl Gateway {
    /// Wire up every component from a validated configuration
    pub fn new(config: &Config) -> anyhow::Result<Arc<Self>> {
        let registry = Arc::new(Registry::from_config(config)?);

        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        }));
        let checker = Arc::new(HealthChecker::new(
            Arc::clone(&pool),
            RetryPolicy::from(&config.health),
        ));
        let supervisor = ProcessSupervisor::new(
            Arc::clone(&registry),
            config.supervisor.shutdown_grace_period(),
        );
        let restarts = RestartController::new(Arc::clone(&supervisor), Arc::clone(&checker));
        let status = StatusAggregator::new(
            Arc::clone(&registry),
            Arc::clone(&checker),
            Arc::clone(&supervisor),
            pool.stats(),
            config.server.port,
            config.gateway.status_probe_timeout(),
        );

        let allowed_origin = HeaderValue::from_str(&config.server.allowed_origin).map_err(|_| {
            anyhow::anyhow!("Invalid allowed_origin: {}", config.server.allowed_origin)
        })?;

        Ok(Arc::new(Self {
            routes: RouteTable::new(&registry),
            home: Bytes::from(home_page(&registry)),
            content: ContentStore::new(&config.server.static_dir, &config.server.dataset_dir),
            registry,
            pool,
            checker,
            supervisor,
            restarts,
            status,
            allowed_origin,
            request_timeout: config.gateway.request_timeout(),
            probe_timeout: config.gateway.status_probe_timeout(),
            probe_before_forward: config.gateway.probe_before_forward,
        }))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn restarts(&self) -> &Arc<RestartController> {
        &self.restarts
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Result<GatewayResponse, hyper::Error> {
        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(method = %method, path, request_id, "Incoming request");

        let response = match self.routes.resolve(&path) {
            None => json_error_response(GatewayErrorCode::NotFound, format!("No route for {}", path)),
            Some(route) if method == Method::OPTIONS => self.preflight(route),
            Some(route) if !route.allows(&method) => {
                let mut response = json_error_response(
                    GatewayErrorCode::MethodNotAllowed,
                    format!("{} is not allowed on {}", method, path),
                );
                if let Ok(allow) = HeaderValue::from_str(&route.allow_header()) {
                    response.headers_mut().insert(header::ALLOW, allow);
                }
                response
            }
            Some(route) => self.dispatch(route, req, &request_id).await,
        };

        Ok(self.finish(response, &path, &request_id))
    }

    /// Cross-origin preflight, answered locally for every registered path
    fn preflight(&self, route: &Route) -> GatewayResponse {
        let mut response = json_response(StatusCode::OK, &serde_json::json!({ "status": "ok" }));
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, self.allowed_origin.clone());
        if let Ok(methods) = HeaderValue::from_str(&route.allow_header()) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOWED_HEADERS),
        );
        response
    }

    fn finish(&self, mut response: GatewayResponse, path: &str, request_id: &str) -> GatewayResponse {
        let headers = response.headers_mut();
        if path.starts_with("/api/") {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, self.allowed_origin.clone());
        }
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        response
    }

    async fn dispatch(&self, route: &Route, req: Request<Incoming>, request_id: &str) -> GatewayResponse {
        match &route.target {
            RouteTarget::Home => html_response(self.home.clone()),
            RouteTarget::GatewayHealth => json_response(
                StatusCode::OK,
                &serde_json::json!({ "status": "healthy", "server": "main" }),
            ),
            RouteTarget::Status => json_response(StatusCode::OK, &self.status.status().await),
            RouteTarget::ServiceStatus(id) => match self.status.service_status(*id).await {
                Some(status) => json_response(StatusCode::OK, &status),
                None => json_error_response(GatewayErrorCode::NotFound, format!("Unknown service {}", id)),
            },
            RouteTarget::Restart => {
                let ticket = self.restarts.trigger();
                json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "message": "Servers are restarting...",
                        "generation": ticket.generation(),
                    }),
                )
            }
            RouteTarget::StaticPage(file) => match self.content.page(file).await {
                Ok(page) => html_response(page),
                Err(e) => {
                    error!(file, error = %e, request_id, "Error loading page");
                    json_error_response(e.code(), e.to_string())
                }
            },
            RouteTarget::Dataset(file) => match self.content.dataset(file).await {
                Ok(data) => bytes_response(StatusCode::OK, "application/json", data),
                Err(e) => {
                    error!(file, error = %e, request_id, "Error loading dataset");
                    json_error_response(e.code(), e.to_string())
                }
            },
            RouteTarget::Proxy {
                service,
                upstream_path,
                forward_auth,
            } => match self
                .forward(req, *service, upstream_path, *forward_auth, request_id)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(service = %service, request_id, error = %e, "Forward failed");
                    e.into_response(*service)
                }
            },
        }
    }

    /// Relay a request to a worker and its answer back, verbatim.
    ///
    /// The timeout covers the whole exchange, including reading the
    /// downstream body.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        service: ServiceId,
        upstream_path: &str,
        forward_auth: bool,
        request_id: &str,
    ) -> Result<GatewayResponse, ForwardError> {
        let descriptor = self.registry.get(service).ok_or(ForwardError::NotRunning)?;

        if !descriptor.is_external() && self.supervisor.current_handle(service).is_none() {
            return Err(ForwardError::NotRunning);
        }

        if self.probe_before_forward && !self.checker.probe(descriptor, self.probe_timeout).await {
            return Err(ForwardError::Unhealthy);
        }

        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(ForwardError::ClientBody)?
            .to_bytes();

        let uri = match parts.uri.query() {
            Some(query) => format!("{}{}?{}", descriptor.base_url(), upstream_path, query),
            None => format!("{}{}", descriptor.base_url(), upstream_path),
        };

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(uri)
            .header(X_REQUEST_ID, request_id);
        if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE) {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        if forward_auth {
            if let Some(auth) = parts.headers.get(header::AUTHORIZATION) {
                builder = builder.header(header::AUTHORIZATION, auth);
            }
        }
        let downstream = builder.body(Full::new(body))?;

        let exchange = async {
            let response = self.pool.send_request(downstream).await?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok::<_, ForwardError>((parts, body))
        };

        let (parts, body) = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| ForwardError::Timeout(self.request_timeout))??;

        if !parts.status.is_success() {
            debug!(service = %service, status = %parts.status, request_id, "UpstreamNonSuccess: relaying as-is");
        }

        let mut response = Response::builder().status(parts.status);
        if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE) {
            response = response.header(header::CONTENT_TYPE, content_type);
        }
        Ok(response.body(full(body))?)
    }
}

fn full(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn bytes_response(status: StatusCode, content_type: &'static str, body: Bytes) -> GatewayResponse {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(full(body))
        .expect("valid response builder")
}

fn html_response(body: Bytes) -> GatewayResponse {
    bytes_response(StatusCode::OK, "text/html; charset=utf-8", body)
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> GatewayResponse {
    match serde_json::to_vec(value) {
        Ok(body) => bytes_response(status, "application/json", Bytes::from(body)),
        Err(e) => json_error_response(
            GatewayErrorCode::InternalError,
            format!("Failed to encode response: {}", e),
        ),
    }
}

/// The public HTTP listener
pub struct GatewayServer {
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    /// Bind the listening socket. Failing here is fatal to the gateway.
    pub async fn bind(
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;

        Ok(Self {
            listener,
            gateway,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, routes = self.gateway.route_count(), "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { gateway.handle_request(req).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
