pub mod classify;
pub mod graph;
pub mod manager;
pub mod patterns;
