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

//! In-memory view of one session, built by folding events.
//!
//! [`MonitorState`] knows nothing about actors or storage. It turns each [`Event`] into the
//! [`MonitorUpdate`]s a presentation layer needs, and answers snapshot queries.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;
use vigil::stats::{aggregate, AggregateStats};
use vigil::{
    Config, CustomEvent, EndpointStats, Event, ExceptionInfo, Hit, LogLine, RequestEvent,
    RouteInfo, RuntimeLogUpdate,
};

/// A change published to whoever draws the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MonitorUpdate {
    HitChanged(Hit),
    Log(LogLine),
    Exception(ExceptionInfo),
    Stats(EndpointStats),
    Custom(CustomEvent),
    Routes(Vec<RouteInfo>),
    /// The displayed session changed and every earlier update is void.
    SessionSwitched { session_id: Option<String> },
}

/// Rebuilds the request message a stored hit was last updated from.
pub fn request_from_hit(hit: &Hit) -> RequestEvent {
    RequestEvent {
        id: hit.id.clone(),
        endpoint: hit.endpoint.clone(),
        method: hit.method.clone(),
        status_code: hit.status_code,
        duration_ms: hit.duration_ms,
        client: hit.client.clone(),
        timestamp: hit.timestamp,
        request_params: hit.request_params.clone(),
        request_body: hit.request_body.clone(),
        request_headers: hit.request_headers.clone(),
        response_body: hit.response_body.clone(),
        runtime_logs: hit.runtime_logs.clone(),
        exceptions: hit.exceptions.clone(),
        pending: hit.pending,
        completed: !hit.pending,
    }
}

/// How many request ids are remembered for counting, long after their hits are evicted.
/// A pending or completion arriving for an id older than this is counted again.
pub const TRACKED_IDS: usize = 50_000;

/// A set of the most recent ids, forgetting the oldest beyond its capacity.
struct IdWindow {
    cap: usize,
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl IdWindow {
    fn new(cap: usize) -> Self {
        IdWindow {
            cap: cap.max(1),
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns false if `id` was already present.
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }
}

pub struct MonitorState {
    max_hits: usize,
    max_lines: usize,
    enable_stats: bool,
    /// Per endpoint, oldest first.
    hits: HashMap<String, VecDeque<Hit>>,
    /// Endpoint of every hit still held in `hits`.
    located: HashMap<String, String>,
    /// Ids counted towards `total_hits`. Outlives eviction from `hits`.
    seen: IdWindow,
    /// Ids whose completion was fed to stats.
    completed: IdWindow,
    stats: HashMap<String, EndpointStats>,
    logs: VecDeque<LogLine>,
    exceptions: VecDeque<ExceptionInfo>,
    routes: Vec<RouteInfo>,
}

impl MonitorState {
    pub fn new(config: &Config) -> Self {
        Self::with_tracked_ids(config, TRACKED_IDS)
    }

    fn with_tracked_ids(config: &Config, tracked_ids: usize) -> Self {
        MonitorState {
            max_hits: config.max_hits_display.max(1),
            max_lines: config.max_log_lines.max(1),
            enable_stats: config.enable_stats,
            hits: HashMap::new(),
            located: HashMap::new(),
            seen: IdWindow::new(tracked_ids),
            completed: IdWindow::new(tracked_ids),
            stats: HashMap::new(),
            logs: VecDeque::new(),
            exceptions: VecDeque::new(),
            routes: Vec::new(),
        }
    }

    pub fn apply(&mut self, event: Event) -> Vec<MonitorUpdate> {
        match event {
            Event::Request(request) => self.apply_request(request),
            Event::RuntimeLogUpdate(update) => self.apply_runtime_logs(update),
            Event::Exception(info) => self.apply_exception(info),
            Event::Log(line) => {
                push_bounded(&mut self.logs, line.clone(), self.max_lines);
                vec![MonitorUpdate::Log(line)]
            }
            Event::Custom(custom) => vec![MonitorUpdate::Custom(custom)],
            Event::StartupRoutes(routes) => {
                self.routes = routes.clone();
                vec![MonitorUpdate::Routes(routes)]
            }
            Event::StatsUpdate(stats) => {
                self.stats.insert(stats.endpoint.clone(), stats.clone());
                vec![MonitorUpdate::Stats(stats)]
            }
            Event::Unknown { kind } => {
                debug!("Skipping event of unknown kind {kind}");
                Vec::new()
            }
        }
    }

    fn hit_mut(&mut self, id: &str) -> Option<&mut Hit> {
        let endpoint = self.located.get(id)?;
        self.hits
            .get_mut(endpoint)?
            .iter_mut()
            .find(|hit| hit.id == id)
    }

    fn insert_hit(&mut self, hit: Hit) {
        let bucket = self.hits.entry(hit.endpoint.clone()).or_default();
        self.located.insert(hit.id.clone(), hit.endpoint.clone());
        bucket.push_back(hit);
        while bucket.len() > self.max_hits {
            if let Some(evicted) = bucket.pop_front() {
                self.located.remove(&evicted.id);
            }
        }
    }

    fn stats_entry(&mut self, endpoint: &str) -> &mut EndpointStats {
        self.stats
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointStats::new(endpoint))
    }

    /// Counts `hit` on first sight of its id and feeds its completion once. Returns the
    /// endpoint's stats when they changed.
    fn record(&mut self, hit: &Hit) -> Option<EndpointStats> {
        if !self.enable_stats {
            return None;
        }
        let mut changed = false;
        if self.seen.insert(&hit.id) {
            self.stats_entry(&hit.endpoint).record_hit(hit.timestamp);
            changed = true;
        }
        if !hit.pending && self.completed.insert(&hit.id) {
            self.stats_entry(&hit.endpoint).record_completion(hit);
            changed = true;
        }
        changed.then(|| self.stats[&hit.endpoint].clone())
    }

    fn apply_request(&mut self, request: RequestEvent) -> Vec<MonitorUpdate> {
        let hit = if request.is_completion() {
            match self.hit_mut(&request.id) {
                Some(hit) => {
                    hit.apply_completion(&request);
                    hit.clone()
                }
                None => {
                    let hit = Hit::from_request(&request);
                    self.insert_hit(hit.clone());
                    hit
                }
            }
        } else {
            if self.located.contains_key(&request.id) || self.seen.contains(&request.id) {
                debug!("Ignoring repeated pending event for {}", request.id);
                return Vec::new();
            }
            let hit = Hit::from_request(&request);
            self.insert_hit(hit.clone());
            hit
        };

        let stats = self.record(&hit);
        let mut updates = vec![MonitorUpdate::HitChanged(hit)];
        updates.extend(stats.map(MonitorUpdate::Stats));
        updates
    }

    fn apply_runtime_logs(&mut self, update: RuntimeLogUpdate) -> Vec<MonitorUpdate> {
        match self.hit_mut(&update.request_id) {
            Some(hit) => {
                hit.runtime_logs = update.all_logs;
                vec![MonitorUpdate::HitChanged(hit.clone())]
            }
            None => {
                debug!("Runtime logs for unknown request {}", update.request_id);
                Vec::new()
            }
        }
    }

    fn apply_exception(&mut self, info: ExceptionInfo) -> Vec<MonitorUpdate> {
        let mut updates = Vec::with_capacity(2);
        if let Some(request_id) = info.request_id.clone() {
            if let Some(hit) = self.hit_mut(&request_id) {
                if !hit.exceptions.iter().any(|e| e.id == info.id) {
                    hit.exceptions.push(info.clone());
                    updates.push(MonitorUpdate::HitChanged(hit.clone()));
                }
            }
        }
        push_bounded(&mut self.exceptions, info.clone(), self.max_lines);
        updates.push(MonitorUpdate::Exception(info));
        updates
    }

    /// Hits of `endpoint`, newest first.
    pub fn hits(&self, endpoint: &str) -> Vec<Hit> {
        self.hits
            .get(endpoint)
            .map(|bucket| bucket.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    pub fn hit(&self, id: &str) -> Option<&Hit> {
        let endpoint = self.located.get(id)?;
        self.hits.get(endpoint)?.iter().find(|hit| hit.id == id)
    }

    /// Endpoints with hits or stats, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self
            .hits
            .keys()
            .chain(self.stats.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        endpoints.sort();
        endpoints
    }

    pub fn stats(&self, endpoint: &str) -> Option<&EndpointStats> {
        self.stats.get(endpoint)
    }

    pub fn aggregate(&self) -> AggregateStats {
        aggregate(&self.stats)
    }

    pub fn logs(&self) -> Vec<LogLine> {
        self.logs.iter().cloned().collect()
    }

    pub fn exceptions(&self) -> Vec<ExceptionInfo> {
        self.exceptions.iter().cloned().collect()
    }

    pub fn routes(&self) -> &[RouteInfo] {
        &self.routes
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    queue.push_back(item);
    while queue.len() > cap {
        queue.pop_front();
    }
}
