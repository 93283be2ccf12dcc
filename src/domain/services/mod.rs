pub mod error_handler;
pub mod exit_rules;
pub mod order_throttle;
pub mod position_manager;
