// Shared fixtures for actor unit tests

pub mod mock_broker;

pub use mock_broker::{feed_credentials, MockBroker};
