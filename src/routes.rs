//! Static routing table
//!
//! Built once from the registry. Services that are not registered get no
//! routes, so a request for them is an ordinary 404.

use crate::registry::{Registry, ServiceId};
use hyper::Method;
use std::collections::HashMap;

/// What a route resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// HTML index page
    Home,
    /// The gateway's own liveness endpoint
    GatewayHealth,
    /// Aggregate status of every service
    Status,
    /// Status of a single service
    ServiceStatus(ServiceId),
    /// Trigger a restart of all workers
    Restart,
    /// HTML file from the static directory
    StaticPage(&'static str),
    /// JSON file from the dataset directory
    Dataset(&'static str),
    /// Forward to a worker
    Proxy {
        service: ServiceId,
        upstream_path: &'static str,
        /// Copy the client's `Authorization` header downstream
        forward_auth: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Route {
    pub path: String,
    pub methods: Vec<Method>,
    pub target: RouteTarget,
}

impl Route {
    fn new(path: impl Into<String>, methods: &[Method], target: RouteTarget) -> Self {
        Self {
            path: path.into(),
            methods: methods.to_vec(),
            target,
        }
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    /// Value for `Allow` / `Access-Control-Allow-Methods`, always including OPTIONS
    pub fn allow_header(&self) -> String {
        let mut methods: Vec<&str> = self.methods.iter().map(Method::as_str).collect();
        methods.push(Method::OPTIONS.as_str());
        methods.join(", ")
    }
}

/// One forwarded path
struct ProxyRoute {
    path: &'static str,
    service: ServiceId,
    upstream_path: &'static str,
    method: Method,
    forward_auth: bool,
}

impl ProxyRoute {
    fn get(path: &'static str, service: ServiceId, upstream_path: &'static str) -> Self {
        Self {
            path,
            service,
            upstream_path,
            method: Method::GET,
            forward_auth: false,
        }
    }

    /// Account backend route; always carries the client's credentials
    fn account(path: &'static str, method: Method) -> Self {
        Self {
            path,
            service: ServiceId::Account,
            upstream_path: path,
            method,
            forward_auth: true,
        }
    }

    fn with_auth(mut self) -> Self {
        self.forward_auth = true;
        self
    }
}

fn proxy_routes() -> Vec<ProxyRoute> {
    vec![
        ProxyRoute::get("/api/get-game", ServiceId::Verb, "/api/get-game"),
        ProxyRoute::get("/api/get-number-game", ServiceId::Number, "/api/get-number-game").with_auth(),
        ProxyRoute::get("/api/tense-question", ServiceId::Tense, "/api/get-tense-question"),
        ProxyRoute::get("/api/get-matching-game", ServiceId::Matching, "/api/get-matching-game"),
        ProxyRoute::account("/api/register", Method::POST),
        ProxyRoute::account("/api/login", Method::POST),
        ProxyRoute::account("/api/update-score", Method::POST),
        ProxyRoute::account("/api/profile", Method::GET),
        ProxyRoute::account("/api/test", Method::GET),
    ]
}

const STATIC_PAGES: &[(&str, &str)] = &[
    ("/sentence-game", "sent_game.html"),
    ("/verb-game", "verb.html"),
    ("/number-game", "number_game.html"),
];

const DATASETS: &[(&str, &str)] = &[
    ("/api/sentences", "sentences.json"),
    ("/api/mtc-game", "matching_game.json"),
];

/// Exact-match path lookup
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: HashMap<String, Route>,
}

impl RouteTable {
    pub fn new(registry: &Registry) -> Self {
        let get: &[Method] = &[Method::GET];
        let mut routes = vec![
            Route::new("/", get, RouteTarget::Home),
            Route::new("/health", get, RouteTarget::GatewayHealth),
            Route::new("/api/status", get, RouteTarget::Status),
            Route::new("/api/restart-servers", get, RouteTarget::Restart),
        ];

        for descriptor in registry.iter() {
            routes.push(Route::new(
                format!("/api/{}-status", descriptor.id.slug()),
                get,
                RouteTarget::ServiceStatus(descriptor.id),
            ));
        }

        for (path, file) in STATIC_PAGES {
            routes.push(Route::new(*path, get, RouteTarget::StaticPage(*file)));
        }

        for (path, file) in DATASETS {
            routes.push(Route::new(*path, get, RouteTarget::Dataset(*file)));
        }

        for proxy in proxy_routes() {
            if !registry.contains(proxy.service) {
                continue;
            }
            routes.push(Route::new(
                proxy.path,
                &[proxy.method],
                RouteTarget::Proxy {
                    service: proxy.service,
                    upstream_path: proxy.upstream_path,
                    forward_auth: proxy.forward_auth,
                },
            ));
        }

        Self {
            routes: routes.into_iter().map(|r| (r.path.clone(), r)).collect(),
        }
    }

    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.get(path)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::ServiceDescriptor;

    fn default_table() -> RouteTable {
        RouteTable::new(&Registry::from_config(&Config::default()).unwrap())
    }

    #[test]
    fn test_local_routes() {
        let table = default_table();

        assert_eq!(table.resolve("/").unwrap().target, RouteTarget::Home);
        assert_eq!(table.resolve("/health").unwrap().target, RouteTarget::GatewayHealth);
        assert_eq!(table.resolve("/api/status").unwrap().target, RouteTarget::Status);
        assert_eq!(table.resolve("/api/restart-servers").unwrap().target, RouteTarget::Restart);
        assert_eq!(
            table.resolve("/verb-game").unwrap().target,
            RouteTarget::StaticPage("verb.html")
        );
        assert_eq!(
            table.resolve("/api/mtc-game").unwrap().target,
            RouteTarget::Dataset("matching_game.json")
        );
    }

    #[test]
    fn test_status_route_per_service() {
        let table = default_table();

        for id in ServiceId::ALL {
            let path = format!("/api/{}-status", id.slug());
            assert_eq!(table.resolve(&path).unwrap().target, RouteTarget::ServiceStatus(id));
        }
    }

    #[test]
    fn test_proxy_routes() {
        let table = default_table();

        let tense = table.resolve("/api/tense-question").unwrap();
        assert_eq!(
            tense.target,
            RouteTarget::Proxy {
                service: ServiceId::Tense,
                upstream_path: "/api/get-tense-question",
                forward_auth: false,
            }
        );

        let login = table.resolve("/api/login").unwrap();
        assert!(login.allows(&Method::POST));
        assert!(!login.allows(&Method::GET));
        assert!(matches!(login.target, RouteTarget::Proxy { forward_auth: true, .. }));

        let number = table.resolve("/api/get-number-game").unwrap();
        assert!(matches!(number.target, RouteTarget::Proxy { forward_auth: true, .. }));
    }

    #[test]
    fn test_allow_header() {
        let table = default_table();

        assert_eq!(table.resolve("/api/register").unwrap().allow_header(), "POST, OPTIONS");
        assert_eq!(table.resolve("/api/status").unwrap().allow_header(), "GET, OPTIONS");
    }

    #[test]
    fn test_unknown_paths() {
        let table = default_table();

        assert!(table.resolve("/api/chess-status").is_none());
        assert!(table.resolve("/api/status/").is_none());
        assert!(table.resolve("/api/generate-sentences").is_none());
    }

    #[test]
    fn test_unregistered_service_has_no_routes() {
        let registry = Registry::new(vec![ServiceDescriptor::external(ServiceId::Verb, 7002)]).unwrap();
        let table = RouteTable::new(&registry);

        assert!(table.resolve("/api/verb-status").is_some());
        assert!(table.resolve("/api/get-game").is_some());
        assert!(table.resolve("/api/tense-status").is_none());
        assert!(table.resolve("/api/tense-question").is_none());
        assert!(table.resolve("/api/login").is_none());
    }
}
