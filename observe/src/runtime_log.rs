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

use serde_json::Value;
use vigil::{Event, RuntimeLogUpdate};

use crate::context;

/// Appends `entry` to the runtime log of the request being handled and pushes the updated
/// log to the monitor straight away, so it shows up before the request completes.
///
/// Returns false, doing nothing, outside a captured request or when runtime logs are off.
pub fn add_runtime_log(entry: impl Into<Value>) -> bool {
    let Some(ctx) = context::current() else {
        return false;
    };
    if !ctx.monitor().config().enable_runtime_logs {
        return false;
    }

    let mut log = entry.into();
    ctx.monitor().config().mask_json(&mut log);
    let all_logs = ctx.push_log(log.clone());

    ctx.client().send(&Event::RuntimeLogUpdate(RuntimeLogUpdate {
        request_id: ctx.request_id().to_string(),
        log,
        all_logs,
    }));
    true
}
