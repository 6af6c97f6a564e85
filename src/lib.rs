pub mod audit;
pub mod autofix;
pub mod capacity;
pub mod config;
pub mod errors;
pub mod generation;
pub mod keypool;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod runtime;
pub mod server;
pub mod store;
pub mod validation;
