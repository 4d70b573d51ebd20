//! Event dispatch
//!
//! Publish/subscribe registry for decoded gateway events, plus the thin
//! parsing layer that canonicalizes event names before dispatch.

mod dispatcher;
mod parser;

pub use dispatcher::{DispatchError, EventCallback, EventDispatcher, SubscriptionId};
pub use parser::{is_registered, parse_event, resolve_alias};
