pub mod binance;
pub mod database;
pub mod hermes;
pub mod relay;
