pub mod appearance;
pub mod config;
pub mod error;
pub mod http_cache;
pub mod http_client;
pub mod league;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod repository;
pub mod sources;
pub mod store;
pub mod tables;
