//! SQLite persistence shared by the job store, embedding store and
//! provider health table.

pub mod db;

pub use db::{from_millis, to_millis, Database};
