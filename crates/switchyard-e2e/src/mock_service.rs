//! Mock HTTP backend for E2E tests
//!
//! Records incoming requests and answers with a configurable response. By
//! default the body is the backend's name, so tests can tell which instance
//! the router picked.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;

/// A recorded HTTP request for test assertions
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone)]
struct Behavior {
    status: StatusCode,
    body: Vec<u8>,
    delay: Duration,
}

/// A mock HTTP backend on an ephemeral port
pub struct MockHttpService {
    addr: SocketAddr,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    behavior: Arc<RwLock<Behavior>>,
}

impl MockHttpService {
    pub async fn start() -> Self {
        Self::start_named("OK").await
    }

    /// Backend whose default response body is `name`
    pub async fn start_named(name: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let requests: Arc<RwLock<Vec<RecordedRequest>>> = Arc::new(RwLock::new(Vec::new()));
        let behavior = Arc::new(RwLock::new(Behavior {
            status: StatusCode::OK,
            body: name.as_bytes().to_vec(),
            delay: Duration::ZERO,
        }));

        let requests_clone = requests.clone();
        let behavior_clone = behavior.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let requests = requests_clone.clone();
                let behavior = behavior_clone.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        let behavior = behavior.clone();
                        async move {
                            let method = req.method().to_string();
                            let uri = req.uri().to_string();
                            let headers: Vec<(String, String)> = req
                                .headers()
                                .iter()
                                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                                .collect();
                            let body = req
                                .into_body()
                                .collect()
                                .await
                                .map(|b| b.to_bytes().to_vec())
                                .unwrap_or_default();

                            requests.write().push(RecordedRequest {
                                method,
                                uri,
                                headers,
                                body,
                            });

                            let behavior = behavior.read().clone();
                            if !behavior.delay.is_zero() {
                                tokio::time::sleep(behavior.delay).await;
                            }
                            let mut response = Response::new(Full::new(Bytes::from(behavior.body)));
                            *response.status_mut() = behavior.status;
                            Ok::<_, Infallible>(response)
                        }
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            requests,
            behavior,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address as discovery reports it (e.g. "127.0.0.1:12345")
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.read().last().cloned()
    }

    pub fn request_count(&self) -> usize {
        self.requests.read().len()
    }

    pub fn set_response_status(&self, status: StatusCode) {
        self.behavior.write().status = status;
    }

    pub fn set_response_body(&self, body: impl Into<Vec<u8>>) {
        self.behavior.write().body = body.into();
    }

    /// Hold every response back for `delay`
    pub fn set_delay(&self, delay: Duration) {
        self.behavior.write().delay = delay;
    }
}

/// An address nothing listens on
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
