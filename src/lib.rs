pub mod client;
pub mod config;
pub mod config_validation;
pub mod errors;
pub mod exit_codes;
pub mod generator;
pub mod load_models;
pub mod metrics;
pub mod multi_scenario;
pub mod percentiles;
pub mod report;
pub mod scenario;
pub mod scheduler;
pub mod suites;
pub mod thresholds;
pub mod utils;
pub mod vu_pool;
pub mod worker;
