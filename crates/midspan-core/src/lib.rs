//! HTTP transaction core for the midspan proxy.
//!
//! The upper half of the protocol core: the transaction state machine that
//! walks a request from the inbound edge through remap, DNS, cache and
//! origin to the response, the N-producer/M-consumer tunnel that moves the
//! bytes, the hook callout driver, the outbound session pool contract, and
//! the header transformations.
//!
//! Everything is sans-IO in the driver style: the machines consume events
//! and return actions; the runtime in `midspan-server` (or a test harness)
//! performs the I/O those actions describe and feeds the results back.

pub mod cache;
pub mod config;
pub mod error;
pub mod headers;
pub mod hooks;
pub mod milestones;
pub mod resolver;
pub mod session;
pub mod transaction;
pub mod tunnel;
pub mod vc;

pub use config::ProxyConfig;
pub use error::{ProxyError, Subcode};
pub use hooks::{CalloutStatus, HookDispatcher, HookId, ObserverVerdict, TxnObserver};
pub use milestones::{Milestone, Milestones};
pub use transaction::{HttpTransaction, TxnAction, TxnEvent};
pub use tunnel::{ChunkingAction, Tunnel, TunnelEvent};
