//! # Call Session Module
//!
//! The conversation lifecycle, split in two layers:
//! - **state**: the pure turn/call state machine (events in, actions out)
//! - **call**: the async driver that owns the transport, audio pipelines and
//!   timers, executes the state machine's actions, and exposes the public
//!   `CallSession` handle

pub mod call;
pub mod state;

pub use call::{AudioDevices, CallSession};
pub use state::{
    CallStatus, ConversationMessage, MessageSender, SessionEvent, SessionState, UiEvent,
};
