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

//! A plain presenter that writes each monitor update to the tracing output.

use ractor::{async_trait, Actor, ActorProcessingErr, ActorRef};
use tracing::{error, info, warn};
use vigil::stats::format_duration;
use vigil::Hit;
use vigil_consume::MonitorUpdate;

/// One line per completed hit, like `GET /items/{id} 200 12.35ms`.
pub fn summarize(hit: &Hit) -> String {
    let status = hit
        .status_code
        .map_or_else(|| "---".to_string(), |code| code.to_string());
    let mut line = format!(
        "{} {} {status} {}",
        hit.method,
        hit.endpoint,
        format_duration(hit.duration_ms)
    );
    if !hit.exceptions.is_empty() {
        line.push_str(&format!(" ({} exceptions)", hit.exceptions.len()));
    }
    line
}

pub struct ConsolePresenter;

#[async_trait]
impl Actor for ConsolePresenter {
    type Msg = MonitorUpdate;
    type State = ();
    type Arguments = ();

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        _: (),
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        update: MonitorUpdate,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match update {
            MonitorUpdate::HitChanged(hit) if !hit.pending => {
                if hit.is_error() {
                    warn!(target: "vigil::hits", "{}", summarize(&hit));
                } else {
                    info!(target: "vigil::hits", "{}", summarize(&hit));
                }
            }
            MonitorUpdate::HitChanged(_) | MonitorUpdate::Stats(_) => (),
            MonitorUpdate::Log(line) => info!(target: "vigil::logs", "[{}] {}", line.kind(), line.message),
            MonitorUpdate::Exception(info) => error!(
                target: "vigil::exceptions",
                "{}: {} ({})",
                info.exception_type,
                info.message,
                info.endpoint.as_deref().unwrap_or("no request")
            ),
            MonitorUpdate::Custom(custom) => info!(
                target: "vigil::custom",
                "{} [{}] {}",
                custom.endpoint,
                custom.level,
                custom.message
            ),
            MonitorUpdate::Routes(routes) => {
                for route in routes {
                    info!(target: "vigil::routes", "{} {}", route.primary_method(), route.path);
                }
            }
            MonitorUpdate::SessionSwitched { session_id } => {
                info!("Displaying session {}", session_id.as_deref().unwrap_or("none"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil::ExceptionInfo;

    #[test]
    fn summary_shows_status_and_duration() {
        let mut hit = Hit {
            id: "a".into(),
            endpoint: "/items/{id}".into(),
            method: "GET".into(),
            timestamp: Utc::now(),
            client: "127.0.0.1".into(),
            request_params: None,
            request_body: None,
            request_headers: None,
            response_body: None,
            status_code: None,
            duration_ms: None,
            runtime_logs: vec![],
            exceptions: vec![],
            pending: true,
        };
        assert_eq!(summarize(&hit), "GET /items/{id} --- N/A");

        hit.status_code = Some(500);
        hit.duration_ms = Some(12.345);
        hit.exceptions.push(ExceptionInfo::new("panic", "boom"));
        assert_eq!(summarize(&hit), "GET /items/{id} 500 12.35ms (1 exceptions)");
    }
}
