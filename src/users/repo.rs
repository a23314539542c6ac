use async_trait::async_trait;
use bson::{doc, oid::ObjectId, DateTime};
use mongodb::{
    error::{ErrorKind, WriteFailure},
    options::IndexOptions,
    Collection, IndexModel,
};
use tracing::debug;

use super::repo_types::{User, USER_COLLECTION};
use super::UserError;
use crate::db::{DbError, MongoHandle};

const DUPLICATE_KEY: i32 = 11000;

/// Persistence for user documents.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn ensure_indexes(&self) -> Result<(), UserError>;
    async fn insert(&self, user: &User) -> Result<ObjectId, UserError>;
    async fn replace(&self, user: &User) -> Result<(), UserError>;
    async fn find_by_id(&self, id: ObjectId) -> Result<Option<User>, UserError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, UserError>;
    /// Match on the stored (hashed) token, ignoring expired ones.
    async fn find_by_reset_token(
        &self,
        token_hash: &str,
        now: DateTime,
    ) -> Result<Option<User>, UserError>;
    async fn touch_last_active(&self, id: ObjectId, at: DateTime) -> Result<(), UserError>;
}

#[derive(Clone, Debug)]
pub struct MongoUserStore {
    collection: Collection<User>,
}

impl MongoUserStore {
    pub fn new(handle: &MongoHandle) -> Self {
        Self {
            collection: handle.collection::<User>(USER_COLLECTION),
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn map_write_error(err: mongodb::error::Error) -> UserError {
    if is_duplicate_key(&err) {
        UserError::DuplicateEmail
    } else {
        UserError::Db(DbError::Operation(err))
    }
}

fn op(err: mongodb::error::Error) -> UserError {
    UserError::Db(DbError::Operation(err))
}

#[async_trait]
impl UserStore for MongoUserStore {
    async fn ensure_indexes(&self) -> Result<(), UserError> {
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! { "email": 1 })
                .options(Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("email_unique".to_string())
                        .build(),
                ))
                .build(),
            IndexModel::builder()
                .keys(doc! { "resetPasswordToken": 1 })
                .options(Some(
                    IndexOptions::builder()
                        .sparse(true)
                        .name("reset_token_index".to_string())
                        .build(),
                ))
                .build(),
        ];
        self.collection.create_indexes(indexes).await.map_err(op)?;
        debug!(collection = USER_COLLECTION, "indexes ensured");
        Ok(())
    }

    async fn insert(&self, user: &User) -> Result<ObjectId, UserError> {
        let result = self
            .collection
            .insert_one(user)
            .await
            .map_err(map_write_error)?;
        result
            .inserted_id
            .as_object_id()
            .ok_or(UserError::NotPersisted)
    }

    async fn replace(&self, user: &User) -> Result<(), UserError> {
        let id = user.id.ok_or(UserError::NotPersisted)?;
        let result = self
            .collection
            .replace_one(doc! { "_id": id }, user)
            .await
            .map_err(map_write_error)?;
        if result.matched_count == 0 {
            return Err(UserError::NotFound);
        }
        Ok(())
    }

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<User>, UserError> {
        self.collection
            .find_one(doc! { "_id": id })
            .await
            .map_err(op)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, UserError> {
        self.collection
            .find_one(doc! { "email": email.trim().to_lowercase() })
            .await
            .map_err(op)
    }

    async fn find_by_reset_token(
        &self,
        token_hash: &str,
        now: DateTime,
    ) -> Result<Option<User>, UserError> {
        self.collection
            .find_one(doc! {
                "resetPasswordToken": token_hash,
                "resetPasswordExpire": { "$gt": now },
            })
            .await
            .map_err(op)
    }

    async fn touch_last_active(&self, id: ObjectId, at: DateTime) -> Result<(), UserError> {
        let result = self
            .collection
            .update_one(doc! { "_id": id }, doc! { "$set": { "lastActive": at } })
            .await
            .map_err(op)?;
        if result.matched_count == 0 {
            return Err(UserError::NotFound);
        }
        Ok(())
    }
}
