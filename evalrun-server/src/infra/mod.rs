pub mod config;
pub mod startup;
pub mod workers;
