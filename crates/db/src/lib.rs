pub mod connection;
pub mod fixtures;
pub mod gateway;
pub mod migrations;
pub mod repositories;

pub use connection::{connect_with_settings, DbPool};
pub use fixtures::{DemoDataset, DemoOrderInfo, SeedResult, VerificationResult};
pub use gateway::{DataStoreGateway, QueryRow, SqliteDataStore};
pub use repositories::{
    session_store_for, InMemorySessionStore, RepositoryError, SessionStore, SqlSessionStore,
};
