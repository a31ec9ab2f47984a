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

//! The actor that owns the consumer's state.
//!
//! Events arrive on the channel endpoint's queue. The dispatcher never awaits that queue:
//! a [`DispatcherMessage::Tick`] every [`TICK_INTERVAL`] drains whatever is buffered, so a
//! silent or slow producer cannot hold up queries or redraws.
//!
//! Everything is persisted against the live session. When an operator browses an older
//! session, live events keep being recorded but are not published until the live session
//! is displayed again.

use std::sync::Arc;
use std::time::Duration;

use ractor::{async_trait, Actor, ActorProcessingErr, ActorRef, OutputPort, RpcReplyPort};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil::stats::AggregateStats;
use vigil::{Config, EndpointStats, Event, ExceptionInfo, Hit, LogLine};

use crate::state::{request_from_hit, MonitorState, MonitorUpdate};
use crate::store::{Session, Store, DEFAULT_HIT_LIMIT};

pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

pub enum DispatcherMessage {
    Tick,
    /// Drains the queue right away and replies with the number of events handled.
    Drain(RpcReplyPort<usize>),
    /// Displays the given session. Switching to the live session resumes live updates.
    SwitchSession(String, RpcReplyPort<bool>),
    DeleteSession(String, RpcReplyPort<bool>),
    GetDisplayedSession(RpcReplyPort<Option<String>>),
    GetLiveSession(RpcReplyPort<Option<String>>),
    GetSessions(RpcReplyPort<Vec<Session>>),
    GetEndpoints(RpcReplyPort<Vec<String>>),
    GetHits(String, RpcReplyPort<Vec<Hit>>),
    GetStats(String, RpcReplyPort<Option<EndpointStats>>),
    GetAggregate(RpcReplyPort<AggregateStats>),
    GetExceptions(RpcReplyPort<Vec<ExceptionInfo>>),
    GetLogs(RpcReplyPort<Vec<LogLine>>),
}

pub struct DispatcherArgs {
    pub config: Arc<Config>,
    pub events: mpsc::Receiver<Event>,
    /// Expected to have its live session started already.
    pub store: Store,
    pub output: Arc<OutputPort<MonitorUpdate>>,
}

pub struct DispatcherState {
    config: Arc<Config>,
    events: mpsc::Receiver<Event>,
    store: Store,
    output: Arc<OutputPort<MonitorUpdate>>,
    live: MonitorState,
    /// A historical session being browsed, with the state rebuilt from its rows.
    browsing: Option<(String, MonitorState)>,
    ticker: Option<JoinHandle<()>>,
}

impl DispatcherState {
    fn displayed(&self) -> &MonitorState {
        match &self.browsing {
            Some((_, state)) => state,
            None => &self.live,
        }
    }

    fn displayed_session(&self) -> Option<String> {
        match &self.browsing {
            Some((id, _)) => Some(id.clone()),
            None => self.store.current_session_id().map(str::to_string),
        }
    }

    fn drain(&mut self) -> usize {
        let mut handled = 0;
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    self.dispatch(event);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("Event queue closed");
                    break;
                }
            }
        }
        handled
    }

    fn dispatch(&mut self, event: Event) {
        if let Event::Log(line) = &event {
            if let Err(e) = self.store.save_log(&line.level, &line.message, line.timestamp) {
                warn!("Failed to persist log line: {e}");
            }
        }

        let updates = self.live.apply(event);
        for update in updates {
            if let MonitorUpdate::HitChanged(hit) = &update {
                if let Err(e) = self.store.save_hit(hit) {
                    warn!("Failed to persist hit {}: {e}", hit.id);
                }
            }
            if self.browsing.is_none() {
                self.output.send(update);
            }
        }
    }

    fn switch_session(&mut self, session_id: String) -> bool {
        if self.store.current_session_id() == Some(session_id.as_str()) {
            self.browsing = None;
            self.publish_switch();
            return true;
        }

        let hits = match self.store.get_recent_hits(&session_id, DEFAULT_HIT_LIMIT) {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Failed to load hits of session {session_id}: {e}");
                return false;
            }
        };
        let logs = match self.store.get_recent_logs(&session_id, self.config.max_log_lines) {
            Ok(logs) => logs,
            Err(e) => {
                warn!("Failed to load logs of session {session_id}: {e}");
                return false;
            }
        };

        let mut state = MonitorState::new(&self.config);
        // stored newest first, replay in arrival order
        for hit in hits.iter().rev() {
            state.apply(Event::Request(request_from_hit(hit)));
        }
        for line in logs {
            state.apply(Event::Log(line));
        }

        info!("Displaying session {session_id}");
        self.browsing = Some((session_id, state));
        self.publish_switch();
        true
    }

    fn publish_switch(&self) {
        self.output.send(MonitorUpdate::SessionSwitched {
            session_id: self.displayed_session(),
        });
    }

    fn delete_session(&mut self, session_id: &str) -> bool {
        if matches!(&self.browsing, Some((id, _)) if id == session_id) {
            self.browsing = None;
            self.publish_switch();
        }
        match self.store.delete_session(session_id) {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("Failed to delete session {session_id}: {e}");
                false
            }
        }
    }
}

/// Replies to a query. The caller may have timed out already, which is not an error here.
fn respond<T>(reply: RpcReplyPort<T>, value: T) {
    if reply.send(value).is_err() {
        debug!("Query caller went away before the reply");
    }
}

pub struct Dispatcher;

#[async_trait]
impl Actor for Dispatcher {
    type Msg = DispatcherMessage;
    type State = DispatcherState;
    type Arguments = DispatcherArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: DispatcherArgs,
    ) -> Result<Self::State, ActorProcessingErr> {
        debug!("{myself:?} starting");
        let live = MonitorState::new(&args.config);
        Ok(DispatcherState {
            config: args.config,
            events: args.events,
            store: args.store,
            output: args.output,
            live,
            browsing: None,
            ticker: None,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.ticker = Some(myself.send_interval(TICK_INTERVAL, || DispatcherMessage::Tick));
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        let handled = state.drain();
        debug!("Dispatcher stopped after draining {handled} late events");
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatcherMessage::Tick => {
                state.drain();
            }
            DispatcherMessage::Drain(reply) => {
                respond(reply, state.drain());
            }
            DispatcherMessage::SwitchSession(session_id, reply) => {
                respond(reply, state.switch_session(session_id));
            }
            DispatcherMessage::DeleteSession(session_id, reply) => {
                respond(reply, state.delete_session(&session_id));
            }
            DispatcherMessage::GetDisplayedSession(reply) => {
                respond(reply, state.displayed_session());
            }
            DispatcherMessage::GetLiveSession(reply) => {
                respond(reply, state.store.current_session_id().map(str::to_string));
            }
            DispatcherMessage::GetSessions(reply) => {
                let sessions = state.store.get_sessions().unwrap_or_else(|e| {
                    warn!("Failed to list sessions: {e}");
                    Vec::new()
                });
                respond(reply, sessions);
            }
            DispatcherMessage::GetEndpoints(reply) => {
                respond(reply, state.displayed().endpoints());
            }
            DispatcherMessage::GetHits(endpoint, reply) => {
                respond(reply, state.displayed().hits(&endpoint));
            }
            DispatcherMessage::GetStats(endpoint, reply) => {
                respond(reply, state.displayed().stats(&endpoint).cloned());
            }
            DispatcherMessage::GetAggregate(reply) => {
                respond(reply, state.displayed().aggregate());
            }
            DispatcherMessage::GetExceptions(reply) => {
                respond(reply, state.displayed().exceptions());
            }
            DispatcherMessage::GetLogs(reply) => {
                respond(reply, state.displayed().logs());
            }
        }
        Ok(())
    }
}
