pub mod actors;
pub mod handlers;
