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

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ractor::{
    call_t, Actor, ActorCell, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent,
};
use tokio::io::BufWriter;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use vigil::{Event, IPC_AUTHKEY_ENV_VAR, IPC_PORT_ENV_VAR};

use crate::{
    generate_token, read_frame, write_frame, ChannelError, ChannelMessage, DISCONNECTED_REASON,
    ENDPOINT_RELEASED_REASON, INVALID_TOKEN_TXT, REGISTRATION_REQ_FAILED_TXT,
    UNEXPECTED_MESSAGE_STR,
};

/// How long a fresh connection has to present its token.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================== Channel Endpoint ============================== //
/// The consumer side of the channel: a loopback listener bound to an ephemeral port, and
/// the receiving end of the queue every accepted connection publishes into.
///
/// The port is bound before anything is spawned, so a bind failure surfaces from
/// [`ChannelEndpoint::open`] instead of inside an actor.
pub struct ChannelEndpoint {
    addr: SocketAddr,
    token: String,
    local: mpsc::Sender<Event>,
    manager: ActorRef<ListenerManagerMessage>,
    handle: JoinHandle<()>,
}

impl ChannelEndpoint {
    /// Binds `127.0.0.1:0`, generates a secret and starts accepting producers. Decoded
    /// events are delivered in arrival order on the returned receiver, which holds at most
    /// `capacity` events before connections stop being read.
    pub async fn open(capacity: usize) -> Result<(Self, mpsc::Receiver<Event>), ChannelError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(ChannelError::Bind)?;
        let addr = listener.local_addr().map_err(ChannelError::Bind)?;
        let token = generate_token();
        let (events, receiver) = mpsc::channel(capacity.max(1));

        let args = ListenerManagerArgs {
            listener,
            token: Arc::from(token.as_str()),
            events: events.clone(),
        };
        let (manager, handle) = Actor::spawn(None, ListenerManager, args)
            .await
            .map_err(|e| ChannelError::Spawn(e.to_string()))?;

        info!("Channel endpoint listening on {addr}");
        Ok((
            ChannelEndpoint {
                addr,
                token,
                local: events,
                manager,
                handle,
            },
            receiver,
        ))
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// A sender into the same queue, for events that originate in this process.
    pub fn local_sender(&self) -> mpsc::Sender<Event> {
        self.local.clone()
    }

    /// The variables a producer needs to find and authenticate against this endpoint.
    pub fn env_vars(&self) -> [(&'static str, String); 2] {
        [
            (IPC_PORT_ENV_VAR, self.port().to_string()),
            (IPC_AUTHKEY_ENV_VAR, self.token.clone()),
        ]
    }

    /// Sets [`Self::env_vars`] on a command that has not been spawned yet.
    pub fn export(&self, command: &mut tokio::process::Command) {
        command.envs(self.env_vars());
    }

    /// Ids of the producers currently registered on this endpoint.
    pub async fn registered_clients(&self) -> Result<Vec<String>, ChannelError> {
        call_t!(self.manager, ListenerManagerMessage::GetClients, 1000)
            .map_err(|e| ChannelError::Spawn(e.to_string()))
    }

    /// Stops accepting, drops every open connection and waits for the listener to exit.
    pub async fn release(self) {
        self.manager.stop(Some(ENDPOINT_RELEASED_REASON.to_string()));
        if let Err(e) = self.handle.await {
            warn!("Channel listener did not shut down cleanly: {e}");
        }
        debug!("Channel endpoint on {} released", self.addr);
    }
}

// ============================== Listener Manager ============================== //
/// Owns the bound socket. Every accepted connection is handed to its own [`Listener`]
/// worker, linked to the manager so it goes away with it.
pub struct ListenerManager;

pub struct ListenerManagerState {
    listener: Option<TcpListener>,
    token: Arc<str>,
    events: mpsc::Sender<Event>,
    accept_loop: Option<AbortHandle>,
    workers: HashMap<String, ActorCell>,
    registered: Vec<String>,
}

pub struct ListenerManagerArgs {
    pub listener: TcpListener,
    pub token: Arc<str>,
    pub events: mpsc::Sender<Event>,
}

pub enum ListenerManagerMessage {
    /// A worker completed the handshake.
    Registered { client_id: String },
    /// A worker's connection ended.
    Disconnected { client_id: String },
    GetClients(RpcReplyPort<Vec<String>>),
}

#[async_trait]
impl Actor for ListenerManager {
    type Msg = ListenerManagerMessage;
    type State = ListenerManagerState;
    type Arguments = ListenerManagerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: ListenerManagerArgs,
    ) -> Result<Self::State, ActorProcessingErr> {
        debug!("ListenerManager: Starting {myself:?}");
        Ok(ListenerManagerState {
            listener: Some(args.listener),
            token: args.token,
            events: args.events,
            accept_loop: None,
            workers: HashMap::new(),
            registered: Vec::new(),
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let server = state
            .listener
            .take()
            .ok_or_else(|| ActorProcessingErr::from("listener socket already taken"))?;
        let token = Arc::clone(&state.token);
        let events = state.events.clone();

        // accept on a separate task so the manager's mailbox stays responsive
        let accept_loop = tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match server.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("ListenerManager: accept failed: {e}");
                        break;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Could not disable Nagle for {peer_addr}: {e}");
                }

                let client_id = uuid::Uuid::new_v4().to_string();
                debug!("ListenerManager: accepted {peer_addr} as {client_id}");

                let args = ListenerArguments {
                    stream,
                    client_id: client_id.clone(),
                    token: Arc::clone(&token),
                    events: events.clone(),
                    manager: myself.clone(),
                };
                if let Err(e) = Actor::spawn_linked(None, Listener, args, myself.get_cell()).await {
                    warn!("ListenerManager: failed to start listener for {peer_addr}: {e}");
                }
            }
        });
        state.accept_loop = Some(accept_loop.abort_handle());
        Ok(())
    }

    async fn post_stop(
        &self,
        _: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(accept_loop) = state.accept_loop.take() {
            accept_loop.abort();
        }
        for (_, worker) in state.workers.drain() {
            worker.stop(Some(ENDPOINT_RELEASED_REASON.to_string()));
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _: ActorRef<Self::Msg>,
        msg: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match msg {
            SupervisionEvent::ActorStarted(actor_cell) => {
                debug!("Listener {:?} started", actor_cell.get_id());
                state
                    .workers
                    .insert(actor_cell.get_id().to_string(), actor_cell);
            }
            SupervisionEvent::ActorTerminated(actor_cell, _, reason) => {
                debug!("Listener {:?} stopped. {reason:?}", actor_cell.get_id());
                state.workers.remove(&actor_cell.get_id().to_string());
            }
            SupervisionEvent::ActorFailed(actor_cell, e) => {
                warn!("Listener {:?} failed! {e}", actor_cell.get_id());
                state.workers.remove(&actor_cell.get_id().to_string());
            }
            SupervisionEvent::ProcessGroupChanged(_) => (),
        }
        Ok(())
    }

    async fn handle(
        &self,
        _: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ListenerManagerMessage::Registered { client_id } => {
                info!("Producer {client_id} registered");
                state.registered.push(client_id);
            }
            ListenerManagerMessage::Disconnected { client_id } => {
                state.registered.retain(|id| *id != client_id);
            }
            ListenerManagerMessage::GetClients(reply) => {
                if reply.send(state.registered.clone()).is_err() {
                    debug!("GetClients caller went away");
                }
            }
        }
        Ok(())
    }
}

// ============================== Listener actor ============================== //
/// Serves one producer connection: verifies the token carried by the first frame, then
/// forwards every published envelope into the endpoint's queue in arrival order.
///
/// Reading happens on a dedicated task that awaits queue capacity before reading the next
/// frame, so a slow consumer pushes back on the socket instead of buffering without bound.
struct Listener;

struct ListenerState {
    client_id: String,
    reader: Option<JoinHandle<()>>,
    manager: ActorRef<ListenerManagerMessage>,
    registered: bool,
}

struct ListenerArguments {
    stream: TcpStream,
    client_id: String,
    token: Arc<str>,
    events: mpsc::Sender<Event>,
    manager: ActorRef<ListenerManagerMessage>,
}

enum ListenerMessage {
    Registered,
    Closed(Option<String>),
}

impl Listener {
    async fn handshake(
        reader: &mut OwnedReadHalf,
        writer: &mut BufWriter<OwnedWriteHalf>,
        client_id: &str,
        token: &str,
    ) -> Result<(), ChannelError> {
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(reader))
            .await
            .map_err(|_| ChannelError::Timeout)??;

        let error = match first {
            Some(ChannelMessage::RegistrationRequest { token: presented }) if presented == token => None,
            Some(ChannelMessage::RegistrationRequest { .. }) => Some(INVALID_TOKEN_TXT.to_string()),
            Some(_) => Some(UNEXPECTED_MESSAGE_STR.to_string()),
            None => return Err(ChannelError::Closed),
        };

        let response = ChannelMessage::RegistrationResponse {
            client_id: client_id.to_string(),
            success: error.is_none(),
            error: error.clone(),
        };
        write_frame(writer, &response).await?;

        match error {
            Some(reason) => Err(ChannelError::Rejected(reason)),
            None => Ok(()),
        }
    }

    async fn serve(
        stream: TcpStream,
        client_id: String,
        token: Arc<str>,
        events: mpsc::Sender<Event>,
        myself: ActorRef<ListenerMessage>,
    ) {
        let (mut reader, writer) = stream.into_split();
        let mut writer = BufWriter::new(writer);

        if let Err(e) = Self::handshake(&mut reader, &mut writer, &client_id, &token).await {
            warn!("{REGISTRATION_REQ_FAILED_TXT} {client_id}: {e}");
            let _ = myself.send_message(ListenerMessage::Closed(Some(e.to_string())));
            return;
        }
        if myself.send_message(ListenerMessage::Registered).is_err() {
            return;
        }

        let reason = loop {
            match read_frame(&mut reader).await {
                Ok(Some(ChannelMessage::Publish { payload })) => match Event::decode(&payload) {
                    Ok(Event::Unknown { kind }) => {
                        debug!("Ignoring event of unknown kind \"{kind}\" from {client_id}");
                    }
                    Ok(event) => {
                        if events.send(event).await.is_err() {
                            break Some("event queue closed".to_string());
                        }
                    }
                    Err(e) => warn!("Dropping undecodable event from {client_id}: {e}"),
                },
                Ok(Some(ChannelMessage::Disconnect)) | Ok(None) => break None,
                Ok(Some(_)) => warn!("{UNEXPECTED_MESSAGE_STR} from {client_id}"),
                Err(e) => break Some(e.to_string()),
            }
        };

        let _ = myself.send_message(ListenerMessage::Closed(reason));
    }
}

#[async_trait]
impl Actor for Listener {
    type Msg = ListenerMessage;
    type State = ListenerState;
    type Arguments = ListenerArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: ListenerArguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let client_id = args.client_id.clone();
        let reader = tokio::spawn(Listener::serve(
            args.stream,
            args.client_id,
            args.token,
            args.events,
            myself,
        ));

        Ok(ListenerState {
            client_id,
            reader: Some(reader),
            manager: args.manager,
            registered: false,
        })
    }

    async fn post_stop(
        &self,
        _: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        if state.registered {
            let _ = state.manager.send_message(ListenerManagerMessage::Disconnected {
                client_id: state.client_id.clone(),
            });
        }
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ListenerMessage::Registered => {
                state.registered = true;
                state
                    .manager
                    .send_message(ListenerManagerMessage::Registered {
                        client_id: state.client_id.clone(),
                    })
                    .map_err(|e| ActorProcessingErr::from(e.to_string()))?;
            }
            ListenerMessage::Closed(reason) => {
                match &reason {
                    Some(reason) => debug!("Connection {} closed: {reason}", state.client_id),
                    None => debug!("Connection {} closed", state.client_id),
                }
                myself.stop(Some(reason.unwrap_or_else(|| DISCONNECTED_REASON.to_string())));
            }
        }
        Ok(())
    }
}
