pub mod batch_planner;
pub mod connection_pool;
pub mod extract;
pub mod join_engine;
pub mod loader;
pub mod pipeline;
pub mod transform;
pub mod warehouse; // Multi-backend warehouse support

pub use batch_planner::*;
pub use connection_pool::*;
pub use extract::*;
pub use join_engine::*;
pub use loader::*;
pub use pipeline::*;
pub use warehouse::{open_warehouse, Dialect, Warehouse, WarehouseConnection};
