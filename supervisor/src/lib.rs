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

//! Runs a monitored service as a child process and the consumer pipeline around it.
//!
//! [`ProcessSupervisor`] opens the channel endpoint, starts a session, spawns the
//! dispatcher and then the producer, whose raw output is forwarded as log events.
//! Stopping it tears everything down in the reverse order, draining late events on the
//! way out.

pub mod console;
pub mod launch;
pub mod supervisor;

pub use launch::{LaunchError, LaunchMode, LaunchSpec};
pub use supervisor::{ProcessSupervisor, ProducerStatus, SupervisorArgs, SupervisorMessage};

pub const SUPERVISOR_NAME: &str = "vigil.supervisor";
