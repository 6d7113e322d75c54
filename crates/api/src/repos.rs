//! Database repositories (SQLite).
//!
//! Durable storage is abstracted behind traits so handlers can be tested
//! against mocks. The only durable state in this service is the users
//! table.

mod users;

pub use users::{SqliteUserRepo, UserRepo, UserRepoError};

#[cfg(test)]
pub use users::MockUserRepo;
