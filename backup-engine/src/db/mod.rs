pub mod connection;
pub mod migrate;

pub use connection::{create_pool, open_in_memory, DbPool};
pub use migrate::migrate;
