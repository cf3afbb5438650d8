//! Host command protocol
//!
//! An [`Action`] arrives as JSON, the [`Dispatcher`] routes it by
//! [`Method`] to the engine, and exactly one [`ActionResult`] goes back.
//! Unsolicited [`Message`]s share the result envelope with an empty id.

mod dispatcher;
mod method;
mod params;
mod protocol;

pub use dispatcher::{AfterSend, Delay, Dispatched, Dispatcher, DispatcherBuilder};
pub use method::Method;
pub use params::dns_servers;
pub use protocol::{
    Action, ActionResult, CODE_FAILURE, CODE_SUCCESS, MESSAGE_METHOD, Message, MessageType,
};
