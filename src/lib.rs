pub mod api;
pub mod config;
pub mod controller;
pub mod daily;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod history;
pub mod power_flow;
pub mod telemetry;
