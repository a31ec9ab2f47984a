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

use std::sync::Arc;

use anyhow::Context;
use ractor::{Actor, OutputPort};
use tracing::info;
use vigil::Config;
use vigil_consume::MonitorUpdate;
use vigil_supervisor::console::ConsolePresenter;
use vigil_supervisor::{LaunchSpec, ProcessSupervisor, SupervisorArgs, SUPERVISOR_NAME};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env().context("invalid monitor configuration")?);
    vigil::init_logging("vigil", &config);

    // everything after `--` is the producer command, verbatim
    let mut command: Vec<String> = std::env::args().skip(1).collect();
    if command.first().map(String::as_str) == Some("--") {
        command.remove(0);
    }
    let launch = LaunchSpec::new(command, &config).context("usage: vigil -- <command> [args...]")?;

    let output: Arc<OutputPort<MonitorUpdate>> = Arc::new(OutputPort::default());
    let (presenter, presenter_handle) = Actor::spawn(None, ConsolePresenter, ())
        .await
        .context("failed to start presenter")?;
    output.subscribe(presenter.clone(), Some);

    let (supervisor, mut handle) = Actor::spawn(
        Some(SUPERVISOR_NAME.to_string()),
        ProcessSupervisor,
        SupervisorArgs {
            config,
            launch,
            output,
        },
    )
    .await
    .context("failed to start supervisor")?;

    let interrupted = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            true
        }
        result = &mut handle => {
            result.context("supervisor panicked")?;
            false
        }
    };
    if interrupted {
        info!("Interrupted, shutting down");
        supervisor.stop(None);
        handle.await.context("supervisor panicked")?;
    }

    presenter.stop(None);
    presenter_handle.await.ok();
    Ok(())
}
