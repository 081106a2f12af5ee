//! Local backends for the capability traits: a directory tree standing in for
//! object storage, and a SQLite database standing in for the warehouse.

pub mod csv_load;
pub mod object_store;
pub mod sqlite;

pub use object_store::LocalObjectStore;
pub use sqlite::SqliteWarehouse;
