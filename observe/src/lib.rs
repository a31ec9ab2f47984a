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

//! Producer-side instrumentation for services monitored by vigil.
//!
//! A [`Monitor`] pairs the configuration inherited from the supervisor with the channel
//! client used to reach it. Everything in this crate becomes a no-op when the monitor has no
//! client, which is the case whenever the service runs on its own.
//!
//! ```ignore
//! let monitor = Monitor::from_env().await?;
//! vigil::init_logging_with("my-service", monitor.config(), monitor.server_log_layer());
//! monitor.announce_routes(vec![RouteInfo { path: "/items/{id}".into(), methods: vec!["GET".into()] }]);
//!
//! let app = Router::new()
//!     .route("/items/{id}", get(load_item))
//!     .route_layer(monitor.layer());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use vigil::{Config, ConfigError, CustomEvent, Event, RouteInfo};
use vigil_channel::ChannelClient;

pub mod body;
pub mod context;
pub mod exception;
pub mod middleware;
pub mod runtime_log;
pub mod server_log;

pub use exception::{capture_exception, error_response};
pub use middleware::{CaptureLayer, CaptureService};
pub use runtime_log::add_runtime_log;
pub use server_log::ServerLogLayer;

#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    config: Arc<Config>,
    client: Option<ChannelClient>,
    routes_announced: AtomicBool,
}

impl Monitor {
    pub fn new(config: Arc<Config>, client: Option<ChannelClient>) -> Self {
        Monitor {
            inner: Arc::new(MonitorInner {
                config,
                client,
                routes_announced: AtomicBool::new(false),
            }),
        }
    }

    /// Reads the configuration handed down by the supervisor and connects through the
    /// process-wide client. A missing or unreachable monitor yields a disabled handle.
    pub async fn from_env() -> Result<Self, ConfigError> {
        let config = Config::from_env()?;
        let client = vigil_channel::client::shared().await;
        Ok(Monitor::new(Arc::new(config), client))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn client(&self) -> Option<&ChannelClient> {
        self.inner.client.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.client.is_some()
    }

    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer::from_monitor(self.clone())
    }

    /// A tracing layer forwarding the service's log output, when connected.
    pub fn server_log_layer(&self) -> Option<ServerLogLayer> {
        self.client()
            .map(|client| ServerLogLayer::new(client.clone(), self.config().log_level))
    }

    /// Sends a user-defined event attached to `endpoint`. `data` is masked like request
    /// bodies.
    pub fn log_custom(
        &self,
        endpoint: &str,
        message: &str,
        data: Option<Value>,
        level: &str,
    ) -> bool {
        let Some(client) = self.client() else {
            return false;
        };
        let mut event = CustomEvent::new(endpoint, message);
        event.level = level.to_string();
        event.data = data.map(|mut data| {
            self.config().mask_json(&mut data);
            data
        });
        client.send(&Event::Custom(event))
    }

    /// Announces the routing table. Only the first call per monitor is sent.
    pub fn announce_routes(&self, routes: Vec<RouteInfo>) -> bool {
        let Some(client) = self.client() else {
            return false;
        };
        if self.inner.routes_announced.swap(true, Ordering::SeqCst) {
            debug!("Routes were already announced");
            return false;
        }
        client.send(&Event::StartupRoutes(routes))
    }
}
