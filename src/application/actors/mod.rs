pub mod engine_registry;
pub mod execution_engine;
pub mod market_stream;

#[cfg(test)]
pub mod tests;

pub use engine_registry::{EngineRegistry, RegistryError};
pub use execution_engine::{
    EngineDeps, EngineEvent, EngineSettings, EngineState, EngineStatus, OrderExecutionEngine,
    SignalOutcome,
};
pub use market_stream::{MarketDataStream, StreamConfig, StreamEvent, TickListener};
