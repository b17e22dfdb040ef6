pub mod action;
pub mod context;
pub mod manager;
pub mod param;
pub mod task;

// Re-export all the key structs and functions
pub use action::*;
pub use context::*;
pub use manager::*;
pub use param::*;
pub use task::*;
