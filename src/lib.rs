pub mod audit;
pub mod calendar;
pub mod codes;
pub mod compactor;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod ratelimit;
pub mod server;
pub mod slots;
pub mod sql;
pub mod tenant;
pub mod wal;
