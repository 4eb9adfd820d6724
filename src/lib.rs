pub mod adapters;
pub mod api;
pub mod config;
pub mod domain;
pub mod engine;
pub mod feeds;
pub mod service;
