pub mod clock;
pub mod config;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod sqlite;
pub mod worker;
