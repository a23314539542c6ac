use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

pub const USER_COLLECTION: &str = "users";
pub const DEFAULT_AVATAR: &str = "https://www.gravatar.com/avatar/000?d=mp";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Student,
    Instructor,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub course: ObjectId,
    pub enrolled_at: DateTime,
}

/// User document in the `users` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    pub email: String,
    /// bcrypt hash once saved; plaintext only between `set_password` and save.
    pub password: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default = "default_avatar")]
    pub avatar: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default)]
    pub enrolled_courses: Vec<Enrollment>,
    #[serde(default)]
    pub created_courses: Vec<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_password_token: Option<String>, // sha256 hex, never the raw token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_password_expire: Option<DateTime>,
    #[serde(default = "DateTime::now")]
    pub last_active: DateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime>,
    #[serde(skip)]
    pub(crate) password_modified: bool,
}

fn default_avatar() -> String {
    DEFAULT_AVATAR.to_string()
}

impl User {
    /// A fresh, unsaved user. The password is hashed on first save.
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            email: email.into(),
            password: password.into(),
            role: Role::default(),
            avatar: default_avatar(),
            bio: None,
            enrolled_courses: Vec::new(),
            created_courses: Vec::new(),
            reset_password_token: None,
            reset_password_expire: None,
            last_active: DateTime::now(),
            created_at: None,
            updated_at: None,
            password_modified: true,
        }
    }

    pub fn total_enrolled_courses(&self) -> usize {
        self.enrolled_courses.len()
    }

    pub fn is_password_modified(&self) -> bool {
        self.password_modified
    }
}
