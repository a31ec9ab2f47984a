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

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufWriter;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use vigil::{Event, IPC_AUTHKEY_ENV_VAR, IPC_PORT_ENV_VAR};

use crate::{read_frame, write_frame, ChannelError, ChannelMessage, UNEXPECTED_MESSAGE_STR};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Envelopes buffered on the producer side before new ones are dropped.
pub const PRODUCER_QUEUE_CAPACITY: usize = 1024;

/// Producer handle on a channel connection.
///
/// [`ChannelClient::send`] never blocks the caller. Envelopes go through a bounded queue
/// drained by a background writer task; when the queue is full the envelope is dropped.
/// Clones share the same connection.
#[derive(Clone, Debug)]
pub struct ChannelClient {
    client_id: Arc<str>,
    sender: mpsc::Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl ChannelClient {
    /// Connects to a consumer on the loopback interface and registers with `token`.
    pub async fn connect(port: u16, token: &str) -> Result<Self, ChannelError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((Ipv4Addr::LOCALHOST, port)))
            .await
            .map_err(|_| ChannelError::Timeout)?
            .map_err(ChannelError::Connect)?;
        stream.set_nodelay(true)?;

        let (mut reader, writer) = stream.into_split();
        let mut writer = BufWriter::new(writer);

        write_frame(
            &mut writer,
            &ChannelMessage::RegistrationRequest {
                token: token.to_string(),
            },
        )
        .await?;

        let response = tokio::time::timeout(CONNECT_TIMEOUT, read_frame(&mut reader))
            .await
            .map_err(|_| ChannelError::Timeout)??;

        let client_id = match response {
            Some(ChannelMessage::RegistrationResponse {
                client_id,
                success: true,
                ..
            }) => client_id,
            Some(ChannelMessage::RegistrationResponse { error, .. }) => {
                return Err(ChannelError::Rejected(error.unwrap_or_default()))
            }
            Some(_) => return Err(ChannelError::Rejected(UNEXPECTED_MESSAGE_STR.to_string())),
            None => return Err(ChannelError::Closed),
        };
        info!("Registered with monitor as {client_id}");

        let (sender, receiver) = mpsc::channel(PRODUCER_QUEUE_CAPACITY);
        tokio::spawn(write_loop(writer, reader, receiver));

        Ok(ChannelClient {
            client_id: Arc::from(client_id.as_str()),
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Connects using the port and secret exported by the consumer.
    pub async fn from_env() -> Result<Self, ChannelError> {
        let port = std::env::var(IPC_PORT_ENV_VAR)
            .ok()
            .and_then(|port| port.trim().parse::<u16>().ok())
            .ok_or(ChannelError::Bootstrap {
                var: IPC_PORT_ENV_VAR,
            })?;
        let token = std::env::var(IPC_AUTHKEY_ENV_VAR)
            .ok()
            .filter(|token| !token.is_empty())
            .ok_or(ChannelError::Bootstrap {
                var: IPC_AUTHKEY_ENV_VAR,
            })?;

        Self::connect(port, &token).await
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queues `event` for delivery. Returns false when the event was dropped, because the
    /// queue is full, the connection is gone or the event cannot be encoded.
    pub fn send(&self, event: &Event) -> bool {
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Not sending {} event: {e}", event.kind());
                return false;
            }
        };

        match self.sender.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Envelopes discarded so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

async fn write_loop(
    mut writer: BufWriter<OwnedWriteHalf>,
    // held so the socket stays fully open while the producer runs
    _reader: OwnedReadHalf,
    mut receiver: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(payload) = receiver.recv().await {
        if let Err(e) = write_frame(&mut writer, &ChannelMessage::Publish { payload }).await {
            warn!("Lost connection to monitor: {e}");
            return;
        }
    }
    if let Err(e) = write_frame(&mut writer, &ChannelMessage::Disconnect).await {
        debug!("Could not say goodbye to monitor: {e}");
    }
}

static SHARED: OnceCell<Option<ChannelClient>> = OnceCell::const_new();

/// The process-wide client, connected from the environment on first use.
///
/// Returns `None` when the process was not started under a monitor, or the connection
/// could not be made. Either way the outcome is remembered and the attempt is not
/// repeated.
pub async fn shared() -> Option<ChannelClient> {
    SHARED
        .get_or_init(|| async {
            match ChannelClient::from_env().await {
                Ok(client) => Some(client),
                Err(e) => {
                    debug!("Monitoring disabled: {e}");
                    None
                }
            }
        })
        .await
        .clone()
}
