pub mod attachment;
pub mod conversation;
pub mod message;
pub mod typing;
