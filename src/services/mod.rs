//! Domain services behind the websocket gateway.
//!
//! ARCHITECTURE
//! ============
//! Service modules own the room coordinator logic and the collaborator
//! contracts so the gateway can stay focused on protocol translation and
//! auth plumbing. Accepted mutations fan out to peers inside the room's
//! critical section — ordering is a service concern, not a gateway one.

pub mod identity;
pub mod object;
pub mod presence;
pub mod room;
pub mod snapshot;
