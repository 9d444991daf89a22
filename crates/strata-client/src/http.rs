//! Generic HTTP execution path for the non-KV services.
//!
//! Picks an endpoint from the routing table's per-service list (random,
//! avoiding the endpoint that failed most recently), attaches basic auth,
//! derives the request timeout from the deadline, follows redirects by
//! hand so the Authorization header survives, and classifies network and
//! 5xx failures through the shared retry-reason taxonomy.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use reqwest::header::LOCATION;
use tokio::sync::watch;

use crate::auth::AuthProvider;
use crate::error::{Error, ErrorKind, Result};
use crate::retry::{default_retry_strategy, RetryContext, RetryReason, RetryStrategy};
use crate::routing::{RoutingTable, ServiceType};

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub service: ServiceType,
    /// HTTP method name, e.g. `"GET"`.
    pub method: String,
    pub path: String,
    pub body: Option<Bytes>,
    pub content_type: Option<String>,
    pub deadline: Instant,
    pub idempotent: bool,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
}

impl HttpRequest {
    pub fn get(service: ServiceType, path: impl Into<String>, deadline: Instant) -> Self {
        Self {
            service,
            method: "GET".to_string(),
            path: path.into(),
            body: None,
            content_type: None,
            deadline,
            idempotent: true,
            retry_strategy: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub endpoint: String,
    pub status: u16,
    pub body: Bytes,
}

pub(crate) struct HttpDispatcher {
    client: reqwest::Client,
    routing: watch::Receiver<Arc<RoutingTable>>,
    auth: Arc<dyn AuthProvider>,
    last_failed: Mutex<Option<String>>,
}

impl HttpDispatcher {
    pub fn new(
        client: reqwest::Client,
        routing: watch::Receiver<Arc<RoutingTable>>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            client,
            routing,
            auth,
            last_failed: Mutex::new(None),
        }
    }

    pub async fn execute(&self, req: HttpRequest) -> Result<HttpResponse> {
        let strategy = req
            .retry_strategy
            .clone()
            .unwrap_or_else(default_retry_strategy);
        let method = reqwest::Method::from_bytes(req.method.as_bytes()).map_err(|_| {
            Error::new(ErrorKind::InvalidArgument)
                .with_context(format!("invalid http method {:?}", req.method))
        })?;

        let mut attempts: u32 = 0;
        let mut reasons: Vec<RetryReason> = Vec::new();
        let mut dispatched = false;

        loop {
            if Instant::now() >= req.deadline {
                return Err(self.timeout(dispatched, &reasons, attempts));
            }

            let endpoint = match self.pick_endpoint(req.service) {
                Some(endpoint) => endpoint,
                None => {
                    attempts += 1;
                    match self.consult(
                        &strategy,
                        &req,
                        RetryReason::ServiceNotAvailable,
                        attempts,
                        &mut reasons,
                    ) {
                        Some(delay) => {
                            self.sleep_capped(delay, req.deadline).await;
                            continue;
                        }
                        None => {
                            return Err(Error::new(ErrorKind::ServiceNotAvailable)
                                .with_context(format!("no endpoints for {:?}", req.service))
                                .with_attempts(&reasons, attempts))
                        }
                    }
                }
            };

            match self
                .attempt(&method, &req, &endpoint, &mut dispatched)
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) => {
                    attempts += 1;
                    *self.last_failed.lock().unwrap() = Some(endpoint.clone());
                    if err.kind.is_timeout() {
                        return Err(err.with_attempts(&reasons, attempts));
                    }
                    let reason = match err.kind {
                        ErrorKind::InternalServerError => RetryReason::ServiceResponseIndicated,
                        ErrorKind::DialFailed | ErrorKind::SocketClosed | ErrorKind::ReadFailed => {
                            RetryReason::SocketNotAvailable
                        }
                        _ => return Err(err.with_attempts(&reasons, attempts)),
                    };
                    match self.consult(&strategy, &req, reason, attempts, &mut reasons) {
                        Some(delay) => self.sleep_capped(delay, req.deadline).await,
                        None => return Err(err.with_attempts(&reasons, attempts)),
                    }
                }
            }
        }
    }

    /// One endpoint attempt, following redirects with auth re-attached.
    async fn attempt(
        &self,
        method: &reqwest::Method,
        req: &HttpRequest,
        endpoint: &str,
        dispatched: &mut bool,
    ) -> Result<HttpResponse> {
        let credentials = self.auth.credentials(req.service, endpoint).await?;
        let mut url = format!("http://{endpoint}{}", req.path);

        for _redirect in 0..=MAX_REDIRECTS {
            let remaining = req
                .deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| Error::new(ErrorKind::AmbiguousTimeout).with_endpoint(endpoint))?;

            let mut builder = self
                .client
                .request(method.clone(), &url)
                .timeout(remaining)
                .basic_auth(&credentials.username, Some(&credentials.password));
            if let Some(body) = &req.body {
                builder = builder.body(body.clone());
            }
            if let Some(content_type) = &req.content_type {
                builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
            }

            *dispatched = true;
            let response = builder.send().await.map_err(|err| {
                let kind = if err.is_connect() {
                    ErrorKind::DialFailed
                } else if err.is_timeout() {
                    ErrorKind::AmbiguousTimeout
                } else {
                    ErrorKind::SocketClosed
                };
                Error::new(kind)
                    .with_endpoint(endpoint)
                    .with_context(err.to_string())
            })?;

            let status = response.status();
            if status.is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                else {
                    return Err(Error::new(ErrorKind::Protocol)
                        .with_endpoint(endpoint)
                        .with_context("redirect without location header"));
                };
                url = if location.starts_with("http://") || location.starts_with("https://") {
                    location.to_string()
                } else {
                    format!("http://{endpoint}{location}")
                };
                continue;
            }
            if status.as_u16() >= 500 {
                return Err(Error::new(ErrorKind::InternalServerError)
                    .with_endpoint(endpoint)
                    .with_context(format!("server returned {status}")));
            }

            let body = response.bytes().await.map_err(|err| {
                Error::new(ErrorKind::ReadFailed)
                    .with_endpoint(endpoint)
                    .with_context(err.to_string())
            })?;
            return Ok(HttpResponse {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Err(Error::new(ErrorKind::ServiceNotAvailable)
            .with_endpoint(endpoint)
            .with_context("redirect limit exceeded"))
    }

    /// Random endpoint for the service, skipping the most recent failure
    /// when an alternative exists.
    fn pick_endpoint(&self, service: ServiceType) -> Option<String> {
        let table = self.routing.borrow().clone();
        let endpoints = table.endpoints_for(service);
        if endpoints.is_empty() {
            return None;
        }
        let avoid = self.last_failed.lock().unwrap().clone();
        let candidates: Vec<&String> = match &avoid {
            Some(failed) if endpoints.len() > 1 => {
                endpoints.iter().filter(|ep| *ep != failed).collect()
            }
            _ => endpoints.iter().collect(),
        };
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }

    fn consult(
        &self,
        strategy: &Arc<dyn RetryStrategy>,
        req: &HttpRequest,
        reason: RetryReason,
        attempts: u32,
        reasons: &mut Vec<RetryReason>,
    ) -> Option<std::time::Duration> {
        let ctx = RetryContext {
            attempts,
            idempotent: req.idempotent,
            reasons: reasons.as_slice(),
        };
        let delay = strategy.retry_after(ctx, reason);
        if delay.is_some() {
            reasons.push(reason);
        }
        delay
    }

    async fn sleep_capped(&self, delay: std::time::Duration, deadline: Instant) {
        let wake = (Instant::now() + delay).min(deadline);
        tokio::time::sleep_until(tokio::time::Instant::from_std(wake)).await;
    }

    fn timeout(&self, dispatched: bool, reasons: &[RetryReason], attempts: u32) -> Error {
        let kind = if dispatched {
            ErrorKind::AmbiguousTimeout
        } else {
            ErrorKind::UnambiguousTimeout
        };
        Error::new(kind).with_attempts(reasons, attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PasswordAuthProvider;
    use crate::routing::RoutingPublisher;

    fn dispatcher(mgmt: Vec<String>) -> HttpDispatcher {
        let mut table = RoutingTable::seed(vec!["kv:11210".into()], Vec::new(), None);
        table.mgmt_endpoints = mgmt;
        let (_publisher, rx) = RoutingPublisher::new(table);
        HttpDispatcher::new(
            reqwest::Client::new(),
            rx,
            Arc::new(PasswordAuthProvider::new("u", "p")),
        )
    }

    #[test]
    fn selection_avoids_the_most_recent_failure() {
        let dispatcher = dispatcher(vec!["a:8091".into(), "b:8091".into(), "c:8091".into()]);
        *dispatcher.last_failed.lock().unwrap() = Some("b:8091".to_string());
        for _ in 0..50 {
            let picked = dispatcher.pick_endpoint(ServiceType::Mgmt).expect("endpoint");
            assert_ne!(picked, "b:8091");
        }
    }

    #[test]
    fn sole_endpoint_is_used_even_after_failing() {
        let dispatcher = dispatcher(vec!["a:8091".into()]);
        *dispatcher.last_failed.lock().unwrap() = Some("a:8091".to_string());
        assert_eq!(
            dispatcher.pick_endpoint(ServiceType::Mgmt).as_deref(),
            Some("a:8091")
        );
    }

    #[test]
    fn services_without_endpoints_yield_none() {
        let dispatcher = dispatcher(Vec::new());
        assert!(dispatcher.pick_endpoint(ServiceType::Query).is_none());
    }
}
