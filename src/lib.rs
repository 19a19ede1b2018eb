pub mod aggregate;
pub mod config;
pub mod error;
pub mod models;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod service;
pub mod telemetry;
pub mod web;
