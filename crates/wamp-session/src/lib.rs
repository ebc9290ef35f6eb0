//! # wamp-session
//!
//! Client-side session state machine for the WAMP-style protocol.
//!
//! - [`PrefixTable`]: bidirectional URI abbreviations announced with PREFIX
//! - [`CallCorrelator`] and [`PendingCall`]: call IDs and single-shot results
//! - [`SubscriptionRegistry`] and [`Subscriber`]: per-topic listener fan-out
//! - [`WampSession`]: owns the above, routes inbound messages by tag, and
//!   sends outbound ones through a [`wamp_core::Transport`]

#![deny(unsafe_code)]

pub mod calls;
pub mod config;
pub mod diagnostics;
pub mod prefix;
pub mod session;
pub mod subscriptions;

pub use calls::{CallCorrelator, PendingCall};
pub use config::SessionConfig;
pub use diagnostics::{Diagnostic, SessionStats};
pub use prefix::PrefixTable;
pub use session::{SessionState, WampSession, Welcome};
pub use subscriptions::{Subscriber, SubscriptionRegistry};
