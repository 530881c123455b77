//! Multi-stage screening funnel for supported nanoclusters: global search,
//! energy and bond-graph filtering, surrogate relaxation and physics
//! relaxation, persisted stage by stage so each can run as its own job.

pub mod analysis;
pub mod core;
pub mod engine;
pub mod pipeline;
