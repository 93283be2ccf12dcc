pub mod activity_store;
pub mod broker_client;
pub mod signal_source;
