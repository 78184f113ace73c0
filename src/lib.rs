//! Coordination core shared by the tabs of one running application.
//!
//! - [`leader`]: elects the tab that owns the live upstream connection and
//!   relays its events to the others
//! - [`conditional`]: remembers response validators so reads can revalidate
//!   instead of refetching
//! - [`offline`]: queues mutations made without connectivity and replays
//!   them in order
//! - [`store`]: the shared storage all of the above is built on
//!
//! [`tab::Origin`] wires the pieces together for one tab.

pub mod clock;
pub mod conditional;
pub mod config;
pub mod leader;
pub mod logging;
pub mod offline;
pub mod store;
pub mod tab;
