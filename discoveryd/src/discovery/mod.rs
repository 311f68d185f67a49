pub mod hash;
pub mod network;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod store;
