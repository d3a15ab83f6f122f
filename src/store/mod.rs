pub mod lock;
pub mod registry;
pub mod repo;
