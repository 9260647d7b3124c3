pub mod assignments;
pub mod handler;
pub mod strategy;

pub use assignments::{AssignmentHistory, MemoryWorkAssignments, WorkAssignments};
pub use handler::{NEAR_COMPLETE_PROGRESS, RedistributeHandler, redistributable};
pub use strategy::{Candidate, ITEM_COST, LEAST_LOADED_MIN_CAPACITY, Planner};
