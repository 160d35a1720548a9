//! NetSentry detection daemon: service config, HTTP surface and agent
//! config discovery

pub mod api;
pub mod bootstrap;
pub mod config;
