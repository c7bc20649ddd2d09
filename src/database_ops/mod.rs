pub mod db;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod provider_client;
pub mod repository;

pub mod giantbomb;
pub mod itad;
pub mod nexarda;
pub mod pricecharting;
pub mod rawg;
pub mod stores;
pub mod tgdb;
