pub mod cli;
pub mod config;
pub mod error;
pub mod telemetry;
pub mod state;
pub mod router;
pub mod retrieval;
pub mod generation;
pub mod tools;
pub mod synthesis;
pub mod workflow;
pub mod server;
pub mod chat;
pub mod doctor;
pub mod profiles;

#[cfg(test)]
mod tests;
