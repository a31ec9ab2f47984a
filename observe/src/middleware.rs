/*
   Polar (OSS)

   Copyright 2024 Carnegie Mellon University.

   NO WARRANTY. THIS CARNEGIE MELLON UNIVERSITY AND SOFTWARE ENGINEERING INSTITUTE MATERIAL IS
   FURNISHED ON AN "AS-IS" BASIS. CARNEGIE MELLON UNIVERSITY MAKES NO WARRANTIES OF ANY KIND,
   EITHER EXPRESSED OR IMPLIED, AS TO ANY MATTER INCLUDING, BUT NOT LIMITED TO, WARRANTY OF FITNESS
   FOR PURPOSE OR MERCHANTABILITY, EXCLUSIVITY, OR RESULTS OBTAINED FROM USE OF THE MATERIAL.
   CARNEGIE MELLON UNIVERSITY DOES NOT MAKE ANY WARRANTY OF ANY KIND WITH RESPECT TO FREEDOM FROM
   PATENT, TRADEMARK, OR COPYRIGHT INFRINGEMENT.

   Licensed under a MIT-style license, please see license.txt or contact permission@sei.cmu.edu for
   full terms.

   [DISTRIBUTION STATEMENT A] This material has been approved for public release and unlimited
   distribution.  Please see Copyright notice for non-US Government use and distribution.

   This Software includes and/or makes use of Third-Party Software each subject to its own license.

   DM24-0470
*/

//! The tower layer that captures every request passing through it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, MatchedPath};
use axum::http::Request;
use axum::response::Response;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use tower::{Layer, Service};
use tracing::debug;
use uuid::Uuid;
use vigil::{Config, ConfigError, Event, RequestEvent};
use vigil_channel::ChannelClient;

use crate::context::{self, RequestContext};
use crate::exception::{self, error_response};
use crate::runtime_log::add_runtime_log;
use crate::{body, Monitor};

/// Captures requests for the monitor.
///
/// Apply it with `Router::route_layer` so the route template is known; with `Router::layer`
/// the raw path is reported instead. Without a channel client the layer passes requests
/// straight through.
#[derive(Clone)]
pub struct CaptureLayer {
    monitor: Monitor,
}

impl CaptureLayer {
    pub fn new(config: Arc<Config>, client: Option<ChannelClient>) -> Self {
        CaptureLayer {
            monitor: Monitor::new(config, client),
        }
    }

    /// Builds the layer from the inherited configuration and the process-wide client.
    pub async fn from_env() -> Result<Self, ConfigError> {
        Ok(Monitor::from_env().await?.layer())
    }

    pub(crate) fn from_monitor(monitor: Monitor) -> Self {
        CaptureLayer { monitor }
    }
}

impl<S> Layer<S> for CaptureLayer {
    type Service = CaptureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CaptureService {
            inner,
            monitor: self.monitor.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CaptureService<S> {
    inner: S,
    monitor: Monitor,
}

impl<S> Service<Request<Body>> for CaptureService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // the clone is not guaranteed to be ready, keep the one that was polled
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let Some(client) = self.monitor.client().cloned() else {
            return Box::pin(inner.call(req));
        };
        if !self
            .monitor
            .config()
            .should_log_request(req.uri().path(), req.method().as_str())
        {
            return Box::pin(inner.call(req));
        }

        Box::pin(capture(inner, req, self.monitor.clone(), client))
    }
}

async fn capture<S>(
    mut inner: S,
    req: Request<Body>,
    monitor: Monitor,
    client: ChannelClient,
) -> Result<Response, S::Error>
where
    S: Service<Request<Body>, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    let started = Instant::now();
    let config = Arc::clone(monitor.config());
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().to_string();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let peer = req
        .extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let request_params = body::query_params(req.uri().query(), &config);
    let request_headers = body::capture_headers(req.headers(), &config);
    let (req, request_body) = body::capture_request_body(req, &config).await;

    let mut event = RequestEvent {
        id: request_id.clone(),
        endpoint: endpoint.clone(),
        method: method.clone(),
        status_code: None,
        duration_ms: None,
        client: peer,
        timestamp: Utc::now(),
        request_params: Some(request_params),
        request_body,
        request_headers: Some(request_headers),
        response_body: None,
        runtime_logs: Vec::new(),
        exceptions: Vec::new(),
        pending: true,
        completed: false,
    };
    if !client.send(&Event::Request(event.clone())) {
        debug!("Pending event for {request_id} was dropped");
    }

    exception::install_panic_hook();
    let ctx = Arc::new(RequestContext::new(
        monitor,
        client.clone(),
        request_id,
        endpoint,
        method,
    ));

    let handler_config = Arc::clone(&config);
    let outcome = context::scope(Arc::clone(&ctx), async move {
        match AssertUnwindSafe(inner.call(req)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let info = exception::capture_panic(&*payload);
                add_runtime_log(json!(format!("Exception from Handler: {}", info.message)));
                Ok(error_response(&info, &handler_config))
            }
        }
    })
    .await;
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

    let result = match outcome {
        Ok(response) => {
            let (response, response_body) = body::capture_response_body(response, &config).await;
            event.status_code = Some(response.status().as_u16());
            event.response_body = response_body;
            Ok(response)
        }
        Err(e) => {
            event.status_code = Some(500);
            Err(e)
        }
    };

    event.duration_ms = Some(duration_ms);
    event.runtime_logs = ctx.logs();
    event.exceptions = ctx.exceptions();
    event.pending = false;
    event.completed = true;
    if !client.send(&Event::Request(event)) {
        debug!("Completed event was dropped");
    }

    result
}
