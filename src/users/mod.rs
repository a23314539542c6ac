pub mod dto;
pub mod repo;
pub mod repo_types;
pub mod services;

pub use dto::PublicUser;
pub use repo::{MongoUserStore, UserStore};
pub use repo_types::{Enrollment, Role, User};
pub use services::{create_user, save_user, ValidationError};

use crate::db::DbError;

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("email already registered")]
    DuplicateEmail,
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("user has not been saved yet")]
    NotPersisted,
    #[error("user not found")]
    NotFound,
    #[error(transparent)]
    Db(#[from] DbError),
}
