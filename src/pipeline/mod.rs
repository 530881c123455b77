pub mod partition;
pub mod runner;
pub mod stage;
pub mod store;
