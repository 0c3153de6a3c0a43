mod header;
mod message;

pub(crate) use header::Header;
pub(crate) use message::{next_request_id, DocumentSequence, Message, MessageFlags};
