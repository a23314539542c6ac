use bson::DateTime;
use serde::Serialize;
use time::OffsetDateTime;

use super::repo_types::{Role, User};

fn to_offset(dt: DateTime) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(dt.timestamp_millis() as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicEnrollment {
    pub course: String,
    #[serde(with = "time::serde::rfc3339")]
    pub enrolled_at: OffsetDateTime,
}

/// Public part of the user returned to clients. Password and reset-token
/// fields have no counterpart here.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Option<String>,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub avatar: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    pub enrolled_courses: Vec<PublicEnrollment>,
    pub created_courses: Vec<String>,
    pub total_enrolled_courses: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.map(|id| id.to_hex()),
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role,
            avatar: user.avatar.clone(),
            bio: user.bio.clone(),
            enrolled_courses: user
                .enrolled_courses
                .iter()
                .map(|e| PublicEnrollment {
                    course: e.course.to_hex(),
                    enrolled_at: to_offset(e.enrolled_at),
                })
                .collect(),
            created_courses: user.created_courses.iter().map(|c| c.to_hex()).collect(),
            total_enrolled_courses: user.total_enrolled_courses(),
            last_active: to_offset(user.last_active),
            created_at: user.created_at.map(to_offset),
            updated_at: user.updated_at.map(to_offset),
        }
    }
}
