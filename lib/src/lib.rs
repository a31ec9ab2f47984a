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

//! Shared vocabulary of the vigil request monitor.
//!
//! Both halves of the pipeline depend on this crate: the producer, which instruments the
//! monitored service, and the consumer, which runs inside the supervisor. It defines:
//!
//! * [`config`]: the one configuration value both processes agree on.
//! * [`events`]: the tagged event envelope and the entities built from it.
//! * [`stats`]: rolling per-endpoint statistics.
//! * [`mask`]: redaction helpers.

use std::io::{stderr, IsTerminal};
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_glog::{Glog, GlogFields, LocalTime};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

pub mod config;
pub mod events;
pub mod mask;
pub mod stats;

pub use config::{Config, ConfigError, LogLevel};
pub use events::{
    CustomEvent, Event, EventError, ExceptionInfo, Hit, LogLine, RequestEvent, RouteInfo,
    RuntimeLogUpdate, StackFrame,
};
pub use stats::{AggregateStats, EndpointStats};

/// Environment variable holding the JSON-serialized [`Config`] handed to the producer.
pub const CONFIG_ENV_VAR: &str = "VIGIL_CONFIG";
/// Environment variable holding the loopback port of the consumer's channel listener.
pub const IPC_PORT_ENV_VAR: &str = "VIGIL_IPC_PORT";
/// Environment variable holding the shared secret for the channel handshake.
pub const IPC_AUTHKEY_ENV_VAR: &str = "VIGIL_IPC_AUTHKEY";

/// Sentinel substituted for any masked header, body field, or captured local.
pub const MASK_SENTINEL: &str = "***";

fn fmt_layer<S>(config: &Config) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_directive()));

    let (writer, ansi) = if config.log_to_file {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file_path)
        {
            Ok(file) => (BoxMakeWriter::new(Mutex::new(file)), false),
            Err(e) => {
                eprintln!(
                    "Failed to open log file {}: {e}, logging to stderr",
                    config.log_file_path.display()
                );
                (BoxMakeWriter::new(std::io::stderr), stderr().is_terminal())
            }
        }
    } else {
        (BoxMakeWriter::new(std::io::stderr), stderr().is_terminal())
    };

    tracing_subscriber::fmt::layer()
        .with_ansi(ansi)
        .with_writer(writer)
        .event_format(Glog::default().with_timer(LocalTime::default()))
        .fmt_fields(GlogFields::default().compact())
        .with_filter(filter)
}

/// Installs the process-wide tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Output goes to stderr, or to
/// `log_file_path` when `log_to_file` is set.
pub fn init_logging(service_name: &str, config: &Config) {
    init_logging_with(service_name, config, None::<tracing_subscriber::layer::Identity>);
}

/// Same as [`init_logging`], with an additional layer registered below the formatter.
pub fn init_logging_with<L>(service_name: &str, config: &Config, extra: Option<L>)
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    if tracing_subscriber::registry()
        .with(extra)
        .with(fmt_layer(config))
        .try_init()
        .is_err()
    {
        eprintln!("Logging registry already initialized");
        return;
    }
    tracing::debug!(service = service_name, level = %config.log_level, "Logging initialized");
}
