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

//! Cross-process event channel between a monitored service (the producer) and the monitor
//! (the consumer).
//!
//! The consumer opens a [`listener::ChannelEndpoint`] on an ephemeral loopback port guarded
//! by a random shared secret. Both values are exported into the producer's environment
//! before it is spawned, and the producer builds a [`client::ChannelClient`] from them on
//! first use.
//!
//! Every frame on the wire is a big-endian `u32` length header followed by an
//! rkyv-archived [`ChannelMessage`]. A zero length frame is a keepalive and is skipped.

use rand::{distr::Alphanumeric, Rng};
use rkyv::rancor;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod client;
pub mod listener;

pub use client::ChannelClient;
pub use listener::ChannelEndpoint;

pub const AUTH_TOKEN_LEN: usize = 32;
/// Largest frame either side accepts. Anything bigger is treated as a corrupt stream.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub const REGISTRATION_REQ_FAILED_TXT: &str = "Failed to register channel client!";
pub const INVALID_TOKEN_TXT: &str = "Invalid channel token";
pub const DISCONNECTED_REASON: &str = "CLIENT_DISCONNECTED";
pub const ENDPOINT_RELEASED_REASON: &str = "ENDPOINT_RELEASED";
pub const UNEXPECTED_MESSAGE_STR: &str = "Received unexpected message!";

/// Messages exchanged over a channel connection.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// First frame sent by a producer. Nothing else is accepted until it succeeds.
    RegistrationRequest { token: String },
    /// The consumer's answer to a registration request.
    RegistrationResponse {
        client_id: String,
        success: bool,
        error: Option<String>,
    },
    /// One JSON encoded event envelope.
    Publish { payload: Vec<u8> },
    /// The producer is going away.
    Disconnect,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to bind channel listener: {0}")]
    Bind(#[source] std::io::Error),
    #[error("failed to start channel listener: {0}")]
    Spawn(String),
    #[error("environment variable {var} is missing or invalid")]
    Bootstrap { var: &'static str },
    #[error("failed to connect to channel: {0}")]
    Connect(#[source] std::io::Error),
    #[error("channel handshake timed out")]
    Timeout,
    #[error("channel registration rejected: {0}")]
    Rejected(String),
    #[error("channel closed by peer")]
    Closed,
    #[error("channel transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel frame error: {0}")]
    Codec(String),
}

/// A fresh random secret for one channel endpoint.
pub fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(AUTH_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Writes one length-prefixed frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, message: &ChannelMessage) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = rkyv::to_bytes::<rancor::Error>(message).map_err(|e| ChannelError::Codec(e.to_string()))?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| ChannelError::Codec(format!("frame of {} bytes is too large", bytes.len())))?;

    let mut buffer = Vec::with_capacity(4 + bytes.len());
    buffer.extend_from_slice(&len.to_be_bytes());
    buffer.extend_from_slice(&bytes);

    writer.write_all(&buffer).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next frame. `Ok(None)` means the peer closed the stream cleanly.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<ChannelMessage>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let len = match reader.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if len == 0 {
            continue;
        }
        if len > MAX_FRAME_LEN {
            return Err(ChannelError::Codec(format!("announced frame of {len} bytes is too large")));
        }

        let mut buffer = vec![0u8; len as usize];
        reader.read_exact(&mut buffer).await?;

        // archived data must be read from an aligned buffer
        let mut aligned = AlignedVec::<16>::with_capacity(buffer.len());
        aligned.extend_from_slice(&buffer);

        return rkyv::from_bytes::<ChannelMessage, rancor::Error>(&aligned)
            .map(Some)
            .map_err(|e| ChannelError::Codec(e.to_string()));
    }
}
