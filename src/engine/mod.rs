pub mod evaluator;
pub mod external;
pub mod handoff;
pub mod surrogate;
