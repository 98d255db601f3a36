//! Conversation flow engine for a WhatsApp-style support line.
//!
//! Flows are step graphs rendered as text, button, or list messages. The
//! [`flow::FlowManager`] drives one conversation turn at a time while the
//! caller owns transport, persistence, and agent hand-off.

pub mod config;
pub mod flow;
pub mod flow_commands;
pub mod logger;
pub mod message;
pub mod schema;
pub mod util;
pub mod watcher;
