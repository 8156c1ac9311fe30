//! Domain specific structures, implementations, and logic

pub mod harvest;
pub mod message;
pub mod pipeline;
pub mod topology;
