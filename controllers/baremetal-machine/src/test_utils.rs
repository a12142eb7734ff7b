//! Test utilities for bootstrap stages and reconcilers
//!
//! Log capture, scripted discovery, an in-memory manager that records
//! every call so tests can check which stages ran, and a mock API server
//! that sits behind a real `kube::Client`.

use std::convert::Infallible;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::{Method, Request, Response, StatusCode, header::CONTENT_TYPE};
use crds::TypeRegistry;
use futures::future::BoxFuture;
use kube::Client;
use kube::client::Body;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing_subscriber::fmt::MakeWriter;

use crate::error::{DiscoveryError, ManagerError};
use crate::manager::Manager;
use crate::readiness::{ApiDiscovery, ApiGroupTarget};

/// Formatted log output captured from a thread-local subscriber
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Route this thread's tracing output into the buffer until the guard drops
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines(&self) -> Vec<String> {
        let buffer = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buffer)
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Number of lines containing `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.lines().iter().filter(|line| line.contains(needle)).count()
    }
}

pub struct CapturedWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CapturedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CapturedWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

/// Discovery that reports the group absent a fixed number of times
pub struct ScriptedDiscovery {
    failures: Option<u32>,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedDiscovery {
    /// Fail `failures` times, then report the group served
    pub fn failing_then_ok(failures: u32) -> Self {
        Self {
            failures: Some(failures),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Never report the group served
    pub fn never() -> Self {
        Self {
            failures: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Virtual time of every call so far
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ApiDiscovery for ScriptedDiscovery {
    async fn supports(&self, target: &ApiGroupTarget) -> Result<(), DiscoveryError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Instant::now());
            calls.len() as u32
        };
        match self.failures {
            Some(failures) if attempt > failures => Ok(()),
            _ => Err(DiscoveryError::GroupAbsent(target.group.to_string())),
        }
    }
}

/// Ordered record of side effects, shared between fakes
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }
}

/// Manager that records calls instead of talking to a cluster
pub struct FakeManager {
    pub journal: Journal,
    pub registry: TypeRegistry,
    pub controllers: Vec<String>,
    pub fail_start: bool,
}

impl FakeManager {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            registry: TypeRegistry::new(),
            controllers: Vec::new(),
            fail_start: false,
        }
    }
}

#[async_trait]
impl Manager for FakeManager {
    type Client = &'static str;

    fn client(&self) -> Self::Client {
        "fake-client"
    }

    fn type_registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn type_registry_mut(&mut self) -> &mut TypeRegistry {
        self.journal.record("schemes");
        &mut self.registry
    }

    async fn start(self, shutdown: BoxFuture<'static, ()>) -> Result<(), ManagerError> {
        self.journal.record("start");
        if self.fail_start {
            return Err(ManagerError::Runnable {
                name: "machine".to_string(),
                reason: "watch failed".to_string(),
            });
        }
        shutdown.await;
        self.journal.record("stopped");
        Ok(())
    }
}

/// Request received by [`ApiServerMock`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub body: Option<Value>,
}

struct Route {
    method: Method,
    path: String,
    status: StatusCode,
    body: Value,
    remaining: Option<usize>,
}

/// Kubernetes API server stand-in for reconciler tests.
///
/// Routes match on method and exact path, first match wins. Unrouted
/// requests get a 404 `Status`, which `Api::get_opt` reads as "absent".
#[derive(Clone, Default)]
pub struct ApiServerMock {
    routes: Arc<Mutex<Vec<Route>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ApiServerMock {
    /// Answer every matching request
    pub fn on(&self, method: Method, path: &str, status: u16, body: Value) -> &Self {
        self.route(method, path, status, body, None)
    }

    /// Answer the next matching request only
    pub fn once(&self, method: Method, path: &str, status: u16, body: Value) -> &Self {
        self.route(method, path, status, body, Some(1))
    }

    fn route(
        &self,
        method: Method,
        path: &str,
        status: u16,
        body: Value,
        remaining: Option<usize>,
    ) -> &Self {
        self.routes.lock().unwrap().push(Route {
            method,
            path: path.to_string(),
            status: StatusCode::from_u16(status).unwrap(),
            body,
            remaining,
        });
        self
    }

    /// Client whose every request is answered by this mock
    pub fn client(&self) -> Client {
        let server = self.clone();
        let service = tower::service_fn(move |request: Request<Body>| {
            let server = server.clone();
            async move { Ok::<_, Infallible>(server.respond(request).await) }
        });
        Client::new(service, "default")
    }

    async fn respond(&self, request: Request<Body>) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let bytes = body.collect_bytes().await.unwrap_or_default();
        let path = parts.uri.path().to_string();
        self.requests.lock().unwrap().push(RecordedRequest {
            method: parts.method.clone(),
            path: path.clone(),
            query: parts.uri.query().unwrap_or_default().to_string(),
            body: serde_json::from_slice(&bytes).ok(),
        });

        let (status, body) = {
            let mut routes = self.routes.lock().unwrap();
            let matched = routes.iter_mut().find(|route| {
                route.method == parts.method && route.path == path && route.remaining != Some(0)
            });
            match matched {
                Some(route) => {
                    if let Some(remaining) = route.remaining.as_mut() {
                        *remaining -= 1;
                    }
                    (route.status, route.body.clone())
                }
                None => (
                    StatusCode::NOT_FOUND,
                    api_status(404, "NotFound", &format!("{} {path} not found", parts.method)),
                ),
            }
        };

        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    /// Every request so far, in arrival order
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests with the given method, in arrival order
    pub fn sent(&self, method: &Method) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.method == *method)
            .collect()
    }
}

/// `metav1.Status` failure body
pub fn api_status(code: u16, reason: &str, message: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Status",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code,
    })
}
