// ===============================
// src/lib.rs
// ===============================
pub mod app;
pub mod autosnipe;
pub mod backoff;
pub mod bus;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod detector;
pub mod domain;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod gateway_mexc;
pub mod health;
pub mod metrics;
pub mod mexc;
pub mod ratelimit;
pub mod recorder;
pub mod risk;
pub mod store;
pub mod validator;
