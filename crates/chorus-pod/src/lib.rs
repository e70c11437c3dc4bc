//! Pod amplification.
//!
//! When a member publishes a post, every other eligible member of the pod
//! reposts it from their own account. The pieces:
//!
//! - [`Dispatcher`] turns one [`AmplificationRequest`] into ledger rows and
//!   staggered repost jobs.
//! - [`RepostWorker`] runs one repost job: resolve the member's session,
//!   drive the browser, record the outcome on the ledger.
//! - [`Reconciler`] finds activities left `queued` with no job behind them and
//!   enqueues one.
//!
//! Jobs travel through two queues, [`DISPATCH_QUEUE`] for incoming triggers
//! and [`REPOST_QUEUE`] for per-member work.

mod dispatcher;
mod error;
mod jobs;
mod reconcile;
mod stagger;
mod worker;

pub use dispatcher::{Dispatcher, fanout_handler, trigger};
pub use error::{DispatchError, ReconcileError};
pub use jobs::{
    AmplificationRequest, DISPATCH_QUEUE, DispatchOutcome, REPOST_QUEUE, RepostJob,
    dispatch_queue_options, repost_queue_options,
};
pub use reconcile::{Reconciler, SweepReport};
pub use stagger::StaggerPolicy;
pub use worker::RepostWorker;
