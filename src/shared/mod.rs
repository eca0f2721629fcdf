pub mod actor;
pub mod error;
pub mod models;
pub mod state;
pub mod utils;
