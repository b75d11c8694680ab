pub mod events;
pub mod queue;

pub use events::{Attachment, AttachmentKind, Delivery, InboundMessage, OutboundMessage};
pub use queue::Bus;
