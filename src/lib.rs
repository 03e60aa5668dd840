pub mod config;
pub mod console;
pub mod db;
pub mod failover;
pub mod geolocation;
pub mod gesture;
pub mod models;
pub mod processor;
pub mod store;
