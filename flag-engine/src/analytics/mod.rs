pub mod aggregator;
pub mod analytics_models;
pub mod retention;
