pub mod protocol;
pub mod signal_queue;
pub mod types;
