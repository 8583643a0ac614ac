pub mod agent;
pub mod atomic;
pub mod config_store;
pub mod feishu;
pub mod poller;
pub mod providers;
pub mod reply;
pub mod resolver;
pub mod service;
pub mod state_store;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
