pub mod comment;
pub mod config;
pub mod links;
pub mod paths;
pub mod state;
pub mod triage;
