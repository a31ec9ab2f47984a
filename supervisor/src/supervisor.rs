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

//! The actor owning the producer subprocess and everything the consumer needs around it.

use std::sync::Arc;
use std::time::Duration;

use ractor::{
    async_trait, Actor, ActorProcessingErr, ActorRef, OutputPort, RpcReplyPort, SupervisionEvent,
};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil::{Config, Event, LogLine};
use vigil_channel::ChannelEndpoint;
use vigil_consume::{Dispatcher, DispatcherArgs, DispatcherMessage, MonitorUpdate, Store};

use crate::launch::{forward_output, LaunchError, LaunchSpec};

/// Events buffered between the channel endpoint and the dispatcher.
pub const EVENT_QUEUE_CAPACITY: usize = 10_000;
/// How long the producer gets to exit after SIGTERM before it is killed.
pub const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(1);
pub const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long output readers get to reach end of file once the producer has exited.
pub const READER_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);
const DRAIN_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerStatus {
    Running { pid: Option<u32> },
    Exited { code: Option<i32> },
    FailedToStart { reason: String },
}

pub enum SupervisorMessage {
    /// Polls the producer for an exit.
    CheckChild,
    /// Runs the shutdown sequence and stops the supervisor.
    Shutdown,
    GetStatus(RpcReplyPort<ProducerStatus>),
    GetDispatcher(RpcReplyPort<ActorRef<DispatcherMessage>>),
}

pub struct SupervisorArgs {
    pub config: Arc<Config>,
    pub launch: LaunchSpec,
    /// Receives every change published by the dispatcher.
    pub output: Arc<OutputPort<MonitorUpdate>>,
}

pub struct SupervisorState {
    endpoint: Option<ChannelEndpoint>,
    dispatcher: ActorRef<DispatcherMessage>,
    child: Option<Child>,
    status: ProducerStatus,
    local: mpsc::Sender<Event>,
    readers: Vec<JoinHandle<usize>>,
    cancel: CancellationToken,
    poller: Option<JoinHandle<()>>,
}

/// Surfaces a problem with the producer both in the consumer's own log and on the
/// monitor's log stream.
fn report(local: &mpsc::Sender<Event>, message: String) {
    error!("{message}");
    if local.try_send(Event::Log(LogLine::new("ERROR", message))).is_err() {
        debug!("Event queue full, producer error not shown");
    }
}

fn launch(
    spec: &LaunchSpec,
    endpoint: &ChannelEndpoint,
    config: &Config,
) -> Result<Child, LaunchError> {
    let mut command = spec.command(endpoint, config)?;
    command.spawn().map_err(|source| LaunchError::Spawn {
        program: spec.program().to_string(),
        source,
    })
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    if let Some(pid) = child.id() {
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

impl SupervisorState {
    async fn stop_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Err(e) = terminate(&mut child) {
            warn!("Failed to signal producer: {e}");
        }
        match tokio::time::timeout(GRACEFUL_EXIT_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Producer exited with {status}");
                self.status = ProducerStatus::Exited { code: status.code() };
            }
            Ok(Err(e)) => warn!("Failed to wait for producer: {e}"),
            Err(_) => {
                warn!("Producer ignored SIGTERM, killing it");
                if let Err(e) = child.kill().await {
                    error!("Failed to kill producer: {e}");
                }
                self.status = ProducerStatus::Exited { code: None };
            }
        }
    }
}

pub struct ProcessSupervisor;

#[async_trait]
impl Actor for ProcessSupervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: SupervisorArgs,
    ) -> Result<Self::State, ActorProcessingErr> {
        debug!("{myself:?} starting");

        // the producer needs the address, so the endpoint comes first
        let (endpoint, events) = ChannelEndpoint::open(EVENT_QUEUE_CAPACITY).await?;
        let local = endpoint.local_sender();

        let mut store = Store::from_config(&args.config);
        if let Err(e) = store.start_new_session() {
            warn!("Failed to start a session, hits will not be persisted: {e}");
        }

        let (dispatcher, _) = Actor::spawn_linked(
            None,
            Dispatcher,
            DispatcherArgs {
                config: Arc::clone(&args.config),
                events,
                store,
                output: args.output,
            },
            myself.get_cell(),
        )
        .await?;

        let cancel = CancellationToken::new();
        let mut readers = Vec::with_capacity(2);
        let (child, status) = match launch(&args.launch, &endpoint, &args.config) {
            Ok(mut child) => {
                let pid = child.id();
                info!(
                    "Started producer {} {:?} (pid {pid:?})",
                    args.launch.program(),
                    args.launch.args()
                );
                if let Some(stdout) = child.stdout.take() {
                    readers.push(tokio::spawn(forward_output(
                        stdout,
                        "stdout",
                        local.clone(),
                        cancel.clone(),
                    )));
                }
                if let Some(stderr) = child.stderr.take() {
                    readers.push(tokio::spawn(forward_output(
                        stderr,
                        "stderr",
                        local.clone(),
                        cancel.clone(),
                    )));
                }
                (Some(child), ProducerStatus::Running { pid })
            }
            Err(e) => {
                report(&local, format!("Producer could not be started: {e}"));
                (
                    None,
                    ProducerStatus::FailedToStart {
                        reason: e.to_string(),
                    },
                )
            }
        };

        Ok(SupervisorState {
            endpoint: Some(endpoint),
            dispatcher,
            child,
            status,
            local,
            readers,
            cancel,
            poller: None,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if state.child.is_some() {
            state.poller =
                Some(myself.send_interval(CHILD_POLL_INTERVAL, || SupervisorMessage::CheckChild));
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(poller) = state.poller.take() {
            poller.abort();
        }

        state.stop_child().await;

        // The producer is gone, so its pipes reach EOF once buffered lines are read.
        // Descendants still holding them open are cut off at the deadline.
        let deadline = Instant::now() + READER_FLUSH_TIMEOUT;
        for mut reader in state.readers.drain(..) {
            let finished = match timeout_at(deadline, &mut reader).await {
                Ok(finished) => finished,
                Err(_) => {
                    debug!("Output reader still open after the producer exited, cancelling");
                    state.cancel.cancel();
                    reader.await
                }
            };
            if let Err(e) = finished {
                warn!("Output reader failed: {e}");
            }
        }
        state.cancel.cancel();

        match ractor::call_t!(state.dispatcher, DispatcherMessage::Drain, DRAIN_TIMEOUT_MS) {
            Ok(drained) => debug!("Final drain handled {drained} events"),
            Err(e) => warn!("Final drain failed: {e}"),
        }
        state.dispatcher.stop(None);

        if let Some(endpoint) = state.endpoint.take() {
            endpoint.release().await;
        }
        info!("Supervisor stopped");
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::CheckChild => {
                let Some(child) = state.child.as_mut() else {
                    return Ok(());
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        state.child = None;
                        state.status = ProducerStatus::Exited { code: status.code() };
                        if let Some(poller) = state.poller.take() {
                            poller.abort();
                        }
                        report(&state.local, format!("Producer exited with {status}"));
                    }
                    Ok(None) => (),
                    Err(e) => warn!("Failed to poll producer: {e}"),
                }
            }
            SupervisorMessage::Shutdown => {
                info!("Shutdown requested");
                myself.stop(None);
            }
            SupervisorMessage::GetStatus(reply) => {
                if reply.send(state.status.clone()).is_err() {
                    debug!("Status caller went away before the reply");
                }
            }
            SupervisorMessage::GetDispatcher(reply) => {
                if reply.send(state.dispatcher.clone()).is_err() {
                    debug!("Dispatcher caller went away before the reply");
                }
            }
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        msg: SupervisionEvent,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match msg {
            SupervisionEvent::ActorStarted(_) => (),
            SupervisionEvent::ActorTerminated(actor_cell, _, reason) => {
                debug!(
                    "Dispatcher {0:?}:{1:?} terminated. {reason:?}",
                    actor_cell.get_name(),
                    actor_cell.get_id()
                );
            }
            SupervisionEvent::ActorFailed(actor_cell, e) => {
                error!(
                    "Dispatcher {0:?}:{1:?} failed! {e:?}",
                    actor_cell.get_name(),
                    actor_cell.get_id()
                );
            }
            SupervisionEvent::ProcessGroupChanged(..) => (),
        }
        Ok(())
    }
}
