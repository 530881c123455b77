pub mod filters;
pub mod topology;
