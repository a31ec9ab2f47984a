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

//! Consumer side of the monitor: folds the producer's events into per-session state,
//! persists them, and publishes every change.
//!
//! * [`state`]: the pure event-folding state machine.
//! * [`store`]: SQLite persistence scoped by session.
//! * [`dispatcher`]: the actor tying both to the channel endpoint's queue.

pub mod dispatcher;
pub mod state;
pub mod store;

pub use dispatcher::{Dispatcher, DispatcherArgs, DispatcherMessage};
pub use state::{MonitorState, MonitorUpdate};
pub use store::{Session, Store, StoreError};

pub const DISPATCHER_NAME: &str = "vigil.dispatcher";
