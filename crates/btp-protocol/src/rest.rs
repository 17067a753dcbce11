//! REST-style dispatch within one resource.
//!
//! A [`RestResourceHandler`] is bound to a resource like any other handler
//! and forwards each action to the route registered for its request method
//! and resource parameter count:
//!
//! ```text
//! GET    /api/3.0/wares        -> (Get, Exactly(0))
//! GET    /api/3.0/wares/12     -> (Get, Exactly(1))
//! POST   /api/3.0/wares/a/b/c  -> (Post, Any)
//! ```
//!
//! Routes registered for [`Params::Any`] catch parameter counts and methods
//! that have no exact route. A known parameter count with an unknown method
//! is answered with 405 and an `Allow` list; an unknown parameter count is
//! answered with 404.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::action::Action;
use crate::errors::{BtpError, Result};
use crate::handler::{authorize, ActionHandler, SecurityContext};
use crate::http::names;
use crate::message::MessageKind;

// ============================================================================
// Validators
// ============================================================================

/// Checks a decoded value, returning why it was rejected.
pub type Validator = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// A validator accepting any value that deserializes into `T`.
pub fn validate_as<T: DeserializeOwned + 'static>() -> Validator {
    Arc::new(|value: &Value| {
        serde_json::from_value::<T>(value.clone())
            .map(drop)
            .map_err(|e| e.to_string())
    })
}

fn check(target: &str, validator: &Validator, value: &Value) -> Result<()> {
    validator(value).map_err(|reason| BtpError::Validation {
        target: target.to_string(),
        reason,
    })
}

// ============================================================================
// Routes
// ============================================================================

/// Resource parameter counts a route accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Params {
    Exactly(usize),
    Any,
}

/// A handler registered on a [`RestResourceHandler`] with its checks.
#[derive(Clone)]
pub struct Route {
    handler: Arc<dyn ActionHandler>,
    resource_validator: Option<Validator>,
    query_validator: Option<Validator>,
    content_validator: Option<Validator>,
    array_query: bool,
}

impl Route {
    pub fn new(handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            handler,
            resource_validator: None,
            query_validator: None,
            content_validator: None,
            array_query: false,
        }
    }

    /// Check the resource parameters, given as an array of strings.
    pub fn with_resource_validator(mut self, validator: Validator) -> Self {
        self.resource_validator = Some(validator);
        self
    }

    /// Check the query variables, given as an object.
    pub fn with_query_validator(mut self, validator: Validator) -> Self {
        self.query_validator = Some(validator);
        self
    }

    /// Receive the request content and check it before the handler runs.
    pub fn with_content_validator(mut self, validator: Validator) -> Self {
        self.content_validator = Some(validator);
        self
    }

    /// Validate query variables as arrays holding every occurrence.
    pub fn with_array_query(mut self) -> Self {
        self.array_query = true;
        self
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("resource_validator", &self.resource_validator.is_some())
            .field("query_validator", &self.query_validator.is_some())
            .field("content_validator", &self.content_validator.is_some())
            .field("array_query", &self.array_query)
            .finish()
    }
}

enum Selection<'a> {
    Found(&'a Route),
    NotFound,
    MethodNotAllowed(Vec<String>),
}

// ============================================================================
// Handler
// ============================================================================

/// Dispatches actions by request method and resource parameter count.
pub struct RestResourceHandler {
    security: SecurityContext,
    routes: HashMap<Params, BTreeMap<MessageKind, Route>>,
}

impl RestResourceHandler {
    /// `security` verifies requests for routes whose policy asks for it.
    pub fn new(security: SecurityContext) -> Self {
        Self {
            security,
            routes: HashMap::new(),
        }
    }

    /// Register `route` for `kind` requests taking `params` parameters,
    /// replacing any route already there.
    pub fn add_route(&mut self, kind: MessageKind, params: Params, route: Route) {
        self.routes.entry(params).or_default().insert(kind, route);
    }

    /// Register a handler with no validators.
    pub fn add_handler(&mut self, kind: MessageKind, params: Params, handler: Arc<dyn ActionHandler>) {
        self.add_route(kind, params, Route::new(handler));
    }

    pub fn route_count(&self) -> usize {
        self.routes.values().map(BTreeMap::len).sum()
    }

    fn select(&self, method: Option<MessageKind>, count: usize) -> Selection<'_> {
        let exact = self.routes.get(&Params::Exactly(count));
        let any = self.routes.get(&Params::Any);
        let Some(mut methods) = exact.or(any) else {
            return Selection::NotFound;
        };
        if let Some(route) = method.and_then(|kind| methods.get(&kind)) {
            return Selection::Found(route);
        }
        if let (Some(_), Some(any)) = (exact, any) {
            methods = any;
            if let Some(route) = method.and_then(|kind| methods.get(&kind)) {
                return Selection::Found(route);
            }
        }
        Selection::MethodNotAllowed(methods.keys().map(|kind| kind.as_str().to_string()).collect())
    }
}

#[async_trait]
impl ActionHandler for RestResourceHandler {
    async fn perform_action(&self, action: &mut Action) -> Result<()> {
        let method = action.request().method().and_then(MessageKind::parse);
        let params = action.resource_params();
        let route = match self.select(method, params.len()) {
            Selection::Found(route) => route,
            Selection::NotFound => {
                return Err(BtpError::ResourceNotFound {
                    resource: action.resource().to_string(),
                })
            }
            Selection::MethodNotAllowed(allowed) => {
                action.response_mut().set(names::ALLOW, allowed.join(", "));
                return Err(BtpError::MethodNotAllowed {
                    resource: action.resource().to_string(),
                    method: action.request().method().unwrap_or_default().to_string(),
                    allowed,
                });
            }
        };

        authorize(route.handler.as_ref(), action, &self.security).await?;

        if let Some(validator) = &route.resource_validator {
            let params = Value::Array(params.into_iter().map(Value::String).collect());
            check("resource", validator, &params)?;
        }
        if let Some(validator) = &route.query_validator {
            let query = Value::Object(action.resource_query(route.array_query));
            check("query", validator, &query)?;
        }
        if let Some(validator) = &route.content_validator {
            let content = action.receive_content().await?;
            check("content", validator, &content)?;
        }

        debug!(resource = %action.resource(), ?method, "Dispatching REST action");
        route.handler.perform_action(action).await
    }
}

impl std::fmt::Debug for RestResourceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestResourceHandler")
            .field("routes", &self.route_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::AuthPolicy;
    use crate::http::HttpConnection;
    use crate::service::BtpService;
    use serde::Deserialize;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Named(&'static str);

    #[async_trait]
    impl ActionHandler for Named {
        async fn perform_action(&self, action: &mut Action) -> Result<()> {
            let params = action.resource_params();
            action
                .send_result_value(json!({ "route": self.0, "params": params }))
                .await
        }
    }

    struct Store;

    #[async_trait]
    impl ActionHandler for Store {
        async fn perform_action(&self, action: &mut Action) -> Result<()> {
            let content = action.receive_content().await?;
            action.send_result_value(json!({ "stored": content })).await
        }
    }

    struct Locked;

    #[async_trait]
    impl ActionHandler for Locked {
        fn auth_policy(&self) -> AuthPolicy {
            AuthPolicy::Required
        }

        async fn perform_action(&self, _action: &mut Action) -> Result<()> {
            panic!("handler must not run without security");
        }
    }

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct ListQuery {
        owner: String,
    }

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct TagQuery {
        tag: Vec<String>,
    }

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct NewWare {
        title: String,
    }

    fn wares() -> RestResourceHandler {
        let mut rest = RestResourceHandler::new(SecurityContext::default());
        rest.add_route(
            MessageKind::Get,
            Params::Exactly(0),
            Route::new(Arc::new(Named("list")))
                .with_query_validator(validate_as::<ListQuery>()),
        );
        rest.add_route(
            MessageKind::Get,
            Params::Exactly(1),
            Route::new(Arc::new(Named("item")))
                .with_resource_validator(Arc::new(|params: &Value| {
                    match params[0].as_str().map(|id| id.parse::<u64>()) {
                        Some(Ok(_)) => Ok(()),
                        _ => Err("ware id must be a number".to_string()),
                    }
                })),
        );
        rest.add_route(
            MessageKind::Post,
            Params::Exactly(0),
            Route::new(Arc::new(Store)).with_content_validator(validate_as::<NewWare>()),
        );
        rest.add_route(
            MessageKind::Get,
            Params::Exactly(2),
            Route::new(Arc::new(Named("tagged")))
                .with_query_validator(validate_as::<TagQuery>())
                .with_array_query(),
        );
        rest.add_handler(MessageKind::Delete, Params::Any, Arc::new(Named("purge")));
        rest.add_handler(MessageKind::Put, Params::Exactly(3), Arc::new(Locked));
        rest
    }

    async fn serve(raw: &str) -> String {
        let service = BtpService::new("/api/3.0", SecurityContext::default());
        service.add_resource("wares", Arc::new(wares()));

        let (mut client, server) = tokio::io::duplex(1 << 16);
        client.write_all(raw.as_bytes()).await.unwrap();
        let mut conn = HttpConnection::new(server, false);
        let request = conn.receive_header().await.unwrap().unwrap();
        let _ = service.service_request(conn, request).await;
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    fn get(target: &str) -> String {
        format!("GET {target} HTTP/1.1\r\nHost: h\r\n\r\n")
    }

    #[test]
    fn test_route_count() {
        assert_eq!(wares().route_count(), 6);
    }

    #[tokio::test]
    async fn test_dispatch_by_param_count() {
        let text = serve(&get("/api/3.0/wares?owner=900")).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains(r#""route":"list""#));

        let text = serve(&get("/api/3.0/wares/12")).await;
        assert!(text.contains(r#""route":"item""#));
        assert!(text.contains(r#""params":["12"]"#));
    }

    #[tokio::test]
    async fn test_unregistered_method_is_405() {
        let text = serve("PUT /api/3.0/wares/12 HTTP/1.1\r\nHost: h\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(text.contains("\r\nAllow: DELETE\r\n"));
        assert!(text.contains("bitmunk.protocol.MethodNotAllowed"));
        assert!(text.contains(r#""invalidMethod":"PUT""#));
    }

    #[tokio::test]
    async fn test_405_lists_methods_for_param_count() {
        let text = serve("PUT /api/3.0/wares HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(text.contains("\r\nAllow: DELETE\r\n"));

        let mut rest = RestResourceHandler::new(SecurityContext::default());
        rest.add_handler(MessageKind::Get, Params::Exactly(0), Arc::new(Named("a")));
        rest.add_handler(MessageKind::Post, Params::Exactly(0), Arc::new(Named("b")));
        match rest.select(Some(MessageKind::Put), 0) {
            Selection::MethodNotAllowed(allowed) => assert_eq!(allowed, vec!["GET", "POST"]),
            _ => panic!("expected 405"),
        }
    }

    #[tokio::test]
    async fn test_any_params_catches_other_counts() {
        let text = serve("DELETE /api/3.0/wares/1/2/3/4 HTTP/1.1\r\nHost: h\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains(r#""route":"purge""#));

        let text = serve("DELETE /api/3.0/wares/12 HTTP/1.1\r\nHost: h\r\n\r\n").await;
        assert!(text.contains(r#""route":"purge""#));
    }

    #[tokio::test]
    async fn test_param_count_mismatch_is_404() {
        let mut rest = RestResourceHandler::new(SecurityContext::default());
        rest.add_handler(MessageKind::Get, Params::Exactly(1), Arc::new(Named("item")));
        assert!(matches!(rest.select(Some(MessageKind::Get), 2), Selection::NotFound));

        let service = BtpService::new("/api", SecurityContext::default());
        service.add_resource("things", Arc::new(rest));
        let (mut client, server) = tokio::io::duplex(1 << 16);
        client
            .write_all(get("/api/things/1/2").as_bytes())
            .await
            .unwrap();
        let mut conn = HttpConnection::new(server, false);
        let request = conn.receive_header().await.unwrap().unwrap();
        let _ = service.service_request(conn, request).await;
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.contains("bitmunk.protocol.ResourceNotFound"));
    }

    #[tokio::test]
    async fn test_query_validator_rejects() {
        let text = serve(&get("/api/3.0/wares?limit=10")).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("bitmunk.protocol.ValidationError"));
        assert!(text.contains(r#""target":"query""#));
        assert!(!text.contains(r#""route":"list""#));
    }

    #[tokio::test]
    async fn test_resource_validator_rejects() {
        let text = serve(&get("/api/3.0/wares/latest")).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains(r#""target":"resource""#));
        assert!(text.contains("ware id must be a number"));
    }

    #[tokio::test]
    async fn test_array_query() {
        let text = serve(&get("/api/3.0/wares/a/b?tag=x&tag=y")).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains(r#""route":"tagged""#));
    }

    fn post(body: &str) -> String {
        format!(
            "POST /api/3.0/wares HTTP/1.1\r\nHost: h\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn test_content_validator() {
        let text = serve(&post(r#"{"title":"Song"}"#)).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains(r#"{"stored":{"title":"Song"}}"#));

        let text = serve(&post(r#"{"title":5}"#)).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains(r#""target":"content""#));
    }

    #[tokio::test]
    async fn test_route_policy_enforced() {
        let text = serve("PUT /api/3.0/wares/1/2/3 HTTP/1.1\r\nHost: h\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("bitmunk.protocol.SecurityConnectionRequired"));
    }
}
