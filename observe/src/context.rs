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

//! Request-scoped state shared by everything that runs inside one captured handler.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use vigil::ExceptionInfo;
use vigil_channel::ChannelClient;

use crate::Monitor;

tokio::task_local! {
    static REQUEST: Arc<RequestContext>;
}

/// What a captured request has accumulated so far. Lives for exactly one handler call and
/// is only reachable from the task polling that handler.
pub struct RequestContext {
    monitor: Monitor,
    client: ChannelClient,
    request_id: String,
    endpoint: String,
    method: String,
    logs: Mutex<Vec<Value>>,
    exceptions: Mutex<Vec<ExceptionInfo>>,
}

impl RequestContext {
    pub(crate) fn new(
        monitor: Monitor,
        client: ChannelClient,
        request_id: String,
        endpoint: String,
        method: String,
    ) -> Self {
        RequestContext {
            monitor,
            client,
            request_id,
            endpoint,
            method,
            logs: Mutex::new(Vec::new()),
            exceptions: Mutex::new(Vec::new()),
        }
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn client(&self) -> &ChannelClient {
        &self.client
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Appends a runtime log entry and returns every entry accumulated so far.
    pub(crate) fn push_log(&self, entry: Value) -> Vec<Value> {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        logs.push(entry);
        logs.clone()
    }

    pub(crate) fn push_exception(&self, info: ExceptionInfo) {
        self.exceptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(info);
    }

    pub fn logs(&self) -> Vec<Value> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn exceptions(&self) -> Vec<ExceptionInfo> {
        self.exceptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The context of the request being handled by the current task, if any.
pub fn current() -> Option<Arc<RequestContext>> {
    REQUEST.try_with(Arc::clone).ok()
}

pub(crate) async fn scope<F: Future>(ctx: Arc<RequestContext>, f: F) -> F::Output {
    REQUEST.scope(ctx, f).await
}
