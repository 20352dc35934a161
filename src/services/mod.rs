pub mod attachment;
pub mod conversation_store;
pub mod delivery_status;
pub mod reconcile;
pub mod thread;
pub mod typing;
