pub mod api_router;
pub mod availability;
pub mod booking;
pub mod catalog;
pub mod config;
pub mod notify;
pub mod payments;
pub mod policy;
pub mod shared;
pub mod sweeper;
