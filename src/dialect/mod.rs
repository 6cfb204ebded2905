pub mod chat;
pub mod messages;

pub use messages::{ContentBlock, ContentPart, Message, MessageContent, MessagesRequest};
