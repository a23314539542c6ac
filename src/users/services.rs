use std::fmt;

use bson::{oid::ObjectId, DateTime};
use lazy_static::lazy_static;
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use super::repo::UserStore;
use super::repo_types::{Enrollment, User};
use super::UserError;

pub const BCRYPT_COST: u32 = 12;
pub const RESET_TOKEN_BYTES: usize = 20;
pub const RESET_TOKEN_TTL: time::Duration = time::Duration::minutes(10);
pub const NAME_MAX_CHARS: usize = 30;
pub const BIO_MAX_CHARS: usize = 500;

// Cost 12 takes seconds per hash in unoptimised test builds.
#[cfg(not(test))]
const HASH_COST: u32 = BCRYPT_COST;
#[cfg(test)]
const HASH_COST: u32 = 4;

/// `\w` is ASCII-only here: `[A-Za-z0-9_]`.
pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex =
            Regex::new(r"(?-u:^\w+([.-]?\w+)*@\w+([.-]?\w+)*(\.\w{2,3})+$)").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub fn hash_password(plain: &str) -> Result<String, UserError> {
    hash_password_with_cost(plain, HASH_COST)
}

pub fn hash_password_with_cost(plain: &str, cost: u32) -> Result<String, UserError> {
    bcrypt::hash(plain, cost).map_err(|e| {
        error!(error = %e, "bcrypt hash error");
        UserError::Hash(e.to_string())
    })
}

pub fn verify_password(plain: &str, hash: &str) -> Result<bool, UserError> {
    bcrypt::verify(plain, hash).map_err(|e| {
        error!(error = %e, "bcrypt verify error");
        UserError::Hash(e.to_string())
    })
}

/// sha256 hex digest; the form reset tokens are stored and looked up in.
pub fn hash_reset_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn millis_after(start: DateTime, delta: time::Duration) -> DateTime {
    DateTime::from_millis(start.timestamp_millis() + delta.whole_milliseconds() as i64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

/// Every constraint a user document failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("validation failed: {}", summarize(.0))]
pub struct ValidationError(pub Vec<FieldError>);

fn summarize(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(FieldError::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ValidationError {
    pub fn has(&self, field: &str) -> bool {
        self.0.iter().any(|f| f.field == field)
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl User {
    /// Trim the name; trim and lowercase the email.
    pub fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.email = self.email.trim().to_lowercase();
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut failed = Vec::new();

        if self.name.is_empty() {
            failed.push(FieldError {
                field: "name",
                message: "Please provide a name",
            });
        } else if self.name.chars().count() > NAME_MAX_CHARS {
            failed.push(FieldError {
                field: "name",
                message: "Name cannot exceed 30 characters",
            });
        }

        if self.email.is_empty() {
            failed.push(FieldError {
                field: "email",
                message: "Please provide an email",
            });
        } else if !is_valid_email(&self.email) {
            failed.push(FieldError {
                field: "email",
                message: "Please provide a valid email address",
            });
        }

        if self.password.is_empty() {
            failed.push(FieldError {
                field: "password",
                message: "Please provide a password",
            });
        }

        if let Some(bio) = &self.bio {
            if bio.chars().count() > BIO_MAX_CHARS {
                failed.push(FieldError {
                    field: "bio",
                    message: "Bio cannot exceed 500 characters",
                });
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ValidationError(failed))
        }
    }

    /// Replace the stored password; it is hashed on the next save.
    pub fn set_password(&mut self, plain: impl Into<String>) {
        self.password = plain.into();
        self.password_modified = true;
    }

    /// Pre-save step: hash the password only if it changed since the last save.
    pub fn prepare_for_save(&mut self) -> Result<(), UserError> {
        if !self.password_modified {
            return Ok(());
        }
        self.password = hash_password(&self.password)?;
        self.password_modified = false;
        debug!("password hashed before save");
        Ok(())
    }

    pub fn match_passwords(&self, candidate: &str) -> Result<bool, UserError> {
        verify_password(candidate, &self.password)
    }

    /// Issue a password-reset token. Only its hash and a 10 minute expiry are
    /// kept on the record; the raw token goes back to the caller.
    pub fn get_reset_password_token(&mut self) -> String {
        let mut bytes = [0u8; RESET_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let raw = hex::encode(bytes);

        self.reset_password_token = Some(hash_reset_token(&raw));
        self.reset_password_expire = Some(millis_after(DateTime::now(), RESET_TOKEN_TTL));
        raw
    }

    pub fn reset_token_matches(&self, raw: &str, now: DateTime) -> bool {
        match (&self.reset_password_token, self.reset_password_expire) {
            (Some(stored), Some(expire)) => *stored == hash_reset_token(raw) && expire > now,
            _ => false,
        }
    }

    pub fn clear_reset_token(&mut self) {
        self.reset_password_token = None;
        self.reset_password_expire = None;
    }

    /// Append an enrollment; enrolling twice in one course is a no-op.
    pub fn enroll(&mut self, course: ObjectId) -> bool {
        if self.enrolled_courses.iter().any(|e| e.course == course) {
            return false;
        }
        self.enrolled_courses.push(Enrollment {
            course,
            enrolled_at: DateTime::now(),
        });
        true
    }

    pub fn add_created_course(&mut self, course: ObjectId) -> bool {
        if self.created_courses.contains(&course) {
            return false;
        }
        self.created_courses.push(course);
        true
    }

    /// Stamp `lastActive` and persist just that field, skipping validation.
    pub async fn update_last_active(&mut self, store: &dyn UserStore) -> Result<(), UserError> {
        let id = self.id.ok_or(UserError::NotPersisted)?;
        let now = DateTime::now();
        self.last_active = now;
        store.touch_last_active(id, now).await
    }
}

/// Normalise, validate, hash and insert a new user.
pub async fn create_user(store: &dyn UserStore, mut user: User) -> Result<User, UserError> {
    user.normalize();
    if let Err(e) = user.validate() {
        warn!(error = %e, "user rejected");
        return Err(e.into());
    }
    user.prepare_for_save()?;

    let now = DateTime::now();
    user.created_at = Some(now);
    user.updated_at = Some(now);

    let id = store.insert(&user).await?;
    user.id = Some(id);
    info!(user_id = %id, email = %user.email, "user created");
    Ok(user)
}

/// Validate, hash if needed and replace an existing user.
pub async fn save_user(store: &dyn UserStore, user: &mut User) -> Result<(), UserError> {
    if user.id.is_none() {
        return Err(UserError::NotPersisted);
    }
    user.normalize();
    user.validate()?;
    user.prepare_for_save()?;
    user.updated_at = Some(DateTime::now());
    store.replace(user).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::repo::testing::MemoryUserStore;

    fn ada() -> User {
        User::new("  Ada Lovelace ", "  Ada@Example.COM ", "analytical-engine")
    }

    #[test]
    fn email_pattern_matches_the_schema_rule() {
        assert!(is_valid_email("ada@example.com"));
        assert!(is_valid_email("first.last-name@mail.example.org"));
        assert!(!is_valid_email("no-at-sign.example.com"));
        assert!(!is_valid_email("ada@example"));
        assert!(!is_valid_email("ada@example.museum"));
        assert!(!is_valid_email("ada @example.com"));
    }

    #[test]
    fn email_word_characters_are_ascii_only() {
        assert!(!is_valid_email("josé@example.com"));
        assert!(!is_valid_email("ada@exämple.com"));
        assert!(!is_valid_email("ada@example.рф"));
        assert!(is_valid_email("jose_1@example.com"));
    }

    #[test]
    fn production_cost_is_twelve() {
        assert_eq!(BCRYPT_COST, 12);
        let hash = hash_password_with_cost("pw", BCRYPT_COST).expect("hash");
        assert!(hash.starts_with("$2b$12$"));
    }

    #[test]
    fn hash_never_equals_plaintext_and_matches_only_the_right_password() {
        let mut user = ada();
        user.prepare_for_save().expect("hash");
        assert_ne!(user.password, "analytical-engine");
        assert!(user.match_passwords("analytical-engine").unwrap());
        assert!(!user.match_passwords("analytical-engine ").unwrap());
        assert!(!user.match_passwords("").unwrap());
    }

    #[test]
    fn matching_works_for_unusual_passwords() {
        for pw in ["x", "päss wörd ✓", "with\nnewline", "\u{1F512}"] {
            let mut user = User::new("A", "a@b.co", pw);
            user.prepare_for_save().unwrap();
            assert!(user.match_passwords(pw).unwrap(), "{pw:?}");
            assert!(!user.match_passwords("other").unwrap(), "{pw:?}");
        }
    }

    #[test]
    fn unchanged_password_is_not_rehashed() {
        let mut user = ada();
        user.prepare_for_save().unwrap();
        let first = user.password.clone();

        user.bio = Some("Countess".into());
        user.prepare_for_save().unwrap();
        assert_eq!(user.password, first);

        user.set_password("difference-engine");
        user.prepare_for_save().unwrap();
        assert_ne!(user.password, first);
        assert!(user.match_passwords("difference-engine").unwrap());
    }

    #[test]
    fn malformed_stored_hash_is_an_error() {
        let mut user = ada();
        user.password = "not-a-bcrypt-hash".into();
        user.password_modified = false;
        assert!(matches!(user.match_passwords("x"), Err(UserError::Hash(_))));
    }

    #[test]
    fn reset_token_is_random_and_only_its_hash_is_kept() {
        let mut user = ada();
        let a = user.get_reset_password_token();
        let stored_a = user.reset_password_token.clone().unwrap();
        let b = user.get_reset_password_token();
        let stored_b = user.reset_password_token.clone().unwrap();

        assert_ne!(a, b);
        assert_eq!(a.len(), RESET_TOKEN_BYTES * 2);
        assert_ne!(stored_a, a);
        assert_eq!(stored_a, hash_reset_token(&a));
        assert_eq!(stored_b, hash_reset_token(&b));
        assert!(user.reset_token_matches(&b, DateTime::now()));
        assert!(!user.reset_token_matches(&a, DateTime::now()));
    }

    #[test]
    fn reset_token_expires_after_ten_minutes() {
        let mut user = ada();
        let before = DateTime::now();
        let raw = user.get_reset_password_token();
        let expire = user.reset_password_expire.unwrap();

        let ttl = expire.timestamp_millis() - before.timestamp_millis();
        assert!((600_000..600_000 + 5_000).contains(&ttl), "ttl {ttl}");
        assert!(!user.reset_token_matches(&raw, millis_after(expire, time::Duration::seconds(1))));

        user.clear_reset_token();
        assert!(user.reset_password_token.is_none());
        assert!(user.reset_password_expire.is_none());
        assert!(!user.reset_token_matches(&raw, before));
    }

    #[test]
    fn validation_reports_every_failing_field() {
        let mut user = User::new("", "nope", "");
        user.bio = Some("b".repeat(501));
        let err = user.validate().unwrap_err();
        assert!(err.has("name"));
        assert!(err.has("email"));
        assert!(err.has("password"));
        assert!(err.has("bio"));
        assert!(err.to_string().contains("Please provide a valid email address"));

        let mut user = User::new("n".repeat(31), "a@b.co", "pw");
        assert!(user.validate().unwrap_err().has("name"));
        user.name = "é".repeat(30);
        user.bio = Some("ü".repeat(500));
        assert!(user.validate().is_ok());
    }

    #[test]
    fn enrollments_are_ordered_and_deduplicated() {
        let mut user = ada();
        let (c1, c2) = (ObjectId::new(), ObjectId::new());
        assert!(user.enroll(c1));
        assert!(user.enroll(c2));
        assert!(!user.enroll(c1));
        assert_eq!(user.total_enrolled_courses(), 2);
        assert_eq!(user.enrolled_courses[0].course, c1);

        assert!(user.add_created_course(c1));
        assert!(!user.add_created_course(c1));
        assert_eq!(user.created_courses, vec![c1]);
    }

    #[tokio::test]
    async fn create_normalizes_hashes_and_assigns_id() {
        let store = MemoryUserStore::default();
        let user = create_user(&store, ada()).await.expect("create");

        assert!(user.id.is_some());
        assert_eq!(user.name, "Ada Lovelace");
        assert_eq!(user.email, "ada@example.com");
        assert!(!user.is_password_modified());
        assert!(user.created_at.is_some());

        let stored = store.find_by_email("ADA@example.com").await.unwrap().unwrap();
        assert_ne!(stored.password, "analytical-engine");
        assert!(stored.match_passwords("analytical-engine").unwrap());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected_case_insensitively() {
        let store = MemoryUserStore::default();
        create_user(&store, User::new("Ada", "ada@example.com", "pw"))
            .await
            .unwrap();

        let err = create_user(&store, User::new("Imposter", " ADA@EXAMPLE.com", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::DuplicateEmail));
    }

    #[tokio::test]
    async fn invalid_user_is_never_persisted() {
        let store = MemoryUserStore::default();
        let err = create_user(&store, User::new("Ada", "bad", "pw")).await.unwrap_err();
        assert!(matches!(err, UserError::Validation(_)));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn save_keeps_hash_when_password_untouched() {
        let store = MemoryUserStore::default();
        let mut user = create_user(&store, ada()).await.unwrap();
        let hash = user.password.clone();

        user.bio = Some("First programmer".into());
        save_user(&store, &mut user).await.unwrap();

        let stored = store.find_by_id(user.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.password, hash);
        assert_eq!(stored.bio.as_deref(), Some("First programmer"));
    }

    #[tokio::test]
    async fn save_requires_a_persisted_user() {
        let store = MemoryUserStore::default();
        let mut user = ada();
        assert!(matches!(
            save_user(&store, &mut user).await,
            Err(UserError::NotPersisted)
        ));
    }

    #[tokio::test]
    async fn update_last_active_touches_only_that_field() {
        let store = MemoryUserStore::default();
        let mut user = create_user(&store, ada()).await.unwrap();
        let before = user.last_active;

        // An invalid in-memory edit must not block the update nor be written.
        user.name = String::new();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        user.update_last_active(&store).await.unwrap();

        let stored = store.find_by_id(user.id.unwrap()).await.unwrap().unwrap();
        assert!(stored.last_active > before);
        assert_eq!(stored.last_active, user.last_active);
        assert_eq!(stored.name, "Ada Lovelace");
    }

    #[tokio::test]
    async fn reset_token_lookup_uses_the_hash() {
        let store = MemoryUserStore::default();
        let mut user = create_user(&store, ada()).await.unwrap();
        let raw = user.get_reset_password_token();
        save_user(&store, &mut user).await.unwrap();

        let now = DateTime::now();
        let found = store
            .find_by_reset_token(&hash_reset_token(&raw), now)
            .await
            .unwrap();
        assert_eq!(found.map(|u| u.id), Some(user.id));
        assert!(store.find_by_reset_token(&raw, now).await.unwrap().is_none());
    }
}
