//! Tower middleware that admits HTTP requests through the bucket queues.
//!
//! For every request the service:
//! 1. derives the [`Subject`] and selects a bucket from the live snapshot;
//! 2. enqueues it, answering `409 Conflict` if the queue is full;
//! 3. waits for a grant, answering `409 Conflict` on timeout;
//! 4. calls the inner service while holding the permit, then releases it.
//!
//! Every response produced here, admitted or rejected, carries the time spent
//! queuing in the configured latency header.

use crate::config::AdmissionConfig;
use crate::drainer::QueueDrainer;
use crate::error::AdmissionError;
use crate::subject::Subject;
use crate::telemetry::{AdmissionEvent, NullSink, TelemetrySink};
use futures::future::BoxFuture;
use http::{HeaderName, HeaderValue, Request, Response};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower_layer::Layer;
use tower_service::Service;

/// Layer that wraps a service with bucket admission control.
pub struct AdmissionLayer<K = NullSink> {
    drainer: Arc<QueueDrainer<K>>,
    wait_timeout: Duration,
    latency_header: HeaderName,
}

impl<K> Clone for AdmissionLayer<K> {
    fn clone(&self) -> Self {
        Self {
            drainer: self.drainer.clone(),
            wait_timeout: self.wait_timeout,
            latency_header: self.latency_header.clone(),
        }
    }
}

impl<K> AdmissionLayer<K> {
    pub fn new(drainer: Arc<QueueDrainer<K>>, config: &AdmissionConfig) -> Self {
        Self {
            drainer,
            wait_timeout: config.wait_timeout(),
            latency_header: config.latency_header().clone(),
        }
    }
}

impl<S, K> Layer<S> for AdmissionLayer<K> {
    type Service = AdmissionService<S, K>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService { inner, layer: self.clone() }
    }
}

/// Service produced by [`AdmissionLayer`].
pub struct AdmissionService<S, K = NullSink> {
    inner: S,
    layer: AdmissionLayer<K>,
}

impl<S: Clone, K> Clone for AdmissionService<S, K> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S, K, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S, K>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
    K: TelemetrySink,
    K::Future: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let layer = self.layer.clone();
        let mut inner = self.inner.clone();
        Box::pin(async move {
            let started = Instant::now();
            let subject = Subject::from_request(&req);
            let bucket = layer.drainer.snapshot().select(&subject).clone();
            let drainer = &layer.drainer;

            let admission = match drainer.enqueue(&bucket) {
                Ok(admission) => admission,
                Err(err) => {
                    tracing::warn!(bucket = %bucket.name, error = %err, "request rejected");
                    let queued = drainer.outstanding();
                    drainer.emit(AdmissionEvent::Rejected { bucket: bucket.name, queued }).await;
                    return Ok(layer.reject(&err, started.elapsed()));
                }
            };
            drainer
                .emit(AdmissionEvent::Enqueued {
                    bucket: bucket.name.clone(),
                    band: bucket.priority,
                    queued: drainer.outstanding(),
                })
                .await;

            let permit = match admission.wait(layer.wait_timeout).await {
                Ok(permit) => permit,
                Err(err) => {
                    let waited = started.elapsed();
                    tracing::warn!(bucket = %bucket.name, ?waited, "request timed out in queue");
                    drainer.emit(AdmissionEvent::TimedOut { bucket: bucket.name, waited }).await;
                    return Ok(layer.reject(&err, waited));
                }
            };

            let waited = started.elapsed();
            let result = inner.call(req).await;
            permit.release();
            let duration = started.elapsed().saturating_sub(waited);
            drainer
                .emit(AdmissionEvent::Completed { bucket: bucket.name, waited, duration })
                .await;

            result.map(|mut response| {
                layer.stamp(&mut response, waited);
                response
            })
        })
    }
}

impl<K> AdmissionLayer<K> {
    fn reject<B: From<String>>(&self, err: &AdmissionError, waited: Duration) -> Response<B> {
        let mut response = Response::new(B::from(err.to_string()));
        *response.status_mut() = err.status();
        self.stamp(&mut response, waited);
        response
    }

    fn stamp<B>(&self, response: &mut Response<B>, waited: Duration) {
        let value = format!("{:.3}ms", waited.as_secs_f64() * 1000.0);
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(self.latency_header.clone(), value);
        }
    }
}
