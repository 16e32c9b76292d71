//! Domain events consumed from the broker.
//!
//! Each event type is the validated record of one queue. Shape errors
//! (missing fields, malformed UUIDs or timestamps, unknown enum members) are
//! caught by serde; the remaining field-level rules live in [`FieldRules`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::processor::{FieldRules, SchemaError};

/// Lifecycle of a friend invite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InviteStatus {
    #[default]
    Sent,
    Accepted,
}

/// A user sent (or accepted) a friend request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendInvite {
    pub sender_user_id: Uuid,
    pub receiver_user_id: Uuid,
    pub request_sent_at: DateTime<Utc>,
    #[serde(default)]
    pub was_read: bool,
    #[serde(default)]
    pub status: InviteStatus,
}

impl FieldRules for FriendInvite {}

/// Someone commented on a post, optionally in reply to another comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPostComment {
    pub post_id: Uuid,
    pub post_author_id: Uuid,
    pub comment_author_id: Uuid,
    pub comment_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_comment_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_comment_author_id: Option<Uuid>,
    #[serde(default)]
    pub was_read: bool,
}

impl FieldRules for NewPostComment {
    fn check(&self) -> Result<(), SchemaError> {
        if self.comment_content.trim().is_empty() {
            return Err(SchemaError::field("commentContent", "must not be empty"));
        }
        Ok(())
    }
}

/// Someone liked a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPostLike {
    pub post_id: Uuid,
    pub post_author_id: Uuid,
    pub liker_user_id: Uuid,
    #[serde(deserialize_with = "like_count")]
    pub total_likes: u64,
    #[serde(default)]
    pub was_read: bool,
}

impl FieldRules for NewPostLike {}

#[derive(Deserialize)]
#[serde(untagged)]
enum LikeCount {
    Number(u64),
    Text(String),
}

/// Producers send the like count either as a JSON number or as a string.
fn like_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match LikeCount::deserialize(deserializer)? {
        LikeCount::Number(n) => Ok(n),
        LikeCount::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid like count '{}'", s))),
    }
}

/// Discriminant of a [`NotificationRecord`], as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    FriendInvite,
    NewPostComment,
    NewPostLike,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::FriendInvite => "friend_invite",
            NotificationKind::NewPostComment => "new_post_comment",
            NotificationKind::NewPostLike => "new_post_like",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated event on its way to the notification store.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationRecord {
    FriendInvite(FriendInvite),
    NewPostComment(NewPostComment),
    NewPostLike(NewPostLike),
}

impl NotificationRecord {
    pub fn kind(&self) -> NotificationKind {
        match self {
            NotificationRecord::FriendInvite(_) => NotificationKind::FriendInvite,
            NotificationRecord::NewPostComment(_) => NotificationKind::NewPostComment,
            NotificationRecord::NewPostLike(_) => NotificationKind::NewPostLike,
        }
    }

    /// Users to notify, deduplicated, in field order.
    pub fn recipients(&self) -> Vec<Uuid> {
        match self {
            NotificationRecord::FriendInvite(invite) => vec![invite.receiver_user_id],
            NotificationRecord::NewPostComment(comment) => {
                let mut recipients = vec![comment.post_author_id];
                if let Some(parent) = comment.parent_comment_author_id {
                    if parent != comment.post_author_id {
                        recipients.push(parent);
                    }
                }
                recipients
            }
            NotificationRecord::NewPostLike(like) => vec![like.post_author_id],
        }
    }

    pub fn was_read(&self) -> bool {
        match self {
            NotificationRecord::FriendInvite(invite) => invite.was_read,
            NotificationRecord::NewPostComment(comment) => comment.was_read,
            NotificationRecord::NewPostLike(like) => like.was_read,
        }
    }

    /// Event body in its wire (camelCase) form.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            NotificationRecord::FriendInvite(invite) => serde_json::to_value(invite),
            NotificationRecord::NewPostComment(comment) => serde_json::to_value(comment),
            NotificationRecord::NewPostLike(like) => serde_json::to_value(like),
        }
    }
}

impl From<FriendInvite> for NotificationRecord {
    fn from(invite: FriendInvite) -> Self {
        NotificationRecord::FriendInvite(invite)
    }
}

impl From<NewPostComment> for NotificationRecord {
    fn from(comment: NewPostComment) -> Self {
        NotificationRecord::NewPostComment(comment)
    }
}

impl From<NewPostLike> for NotificationRecord {
    fn from(like: NewPostLike) -> Self {
        NotificationRecord::NewPostLike(like)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{Schema, Typed};
    use serde_json::json;

    const SENDER: &str = "6f1c2a3e-5b7d-4c1e-9f2a-0d3b4c5e6f70";
    const RECEIVER: &str = "0b9e8d7c-6a5f-4e3d-8c2b-1a0f9e8d7c6b";

    fn invite_body() -> Value {
        json!({
            "senderUserId": SENDER,
            "receiverUserId": RECEIVER,
            "requestSentAt": "2024-03-01T12:00:00Z",
        })
    }

    #[test]
    fn test_friend_invite_defaults() {
        let invite = Typed::<FriendInvite>::new("FriendInvite")
            .validate(invite_body())
            .unwrap();

        assert_eq!(invite.receiver_user_id, Uuid::parse_str(RECEIVER).unwrap());
        assert_eq!(invite.status, InviteStatus::Sent);
        assert!(!invite.was_read);
    }

    #[test]
    fn test_friend_invite_accepted_status() {
        let mut body = invite_body();
        body["status"] = json!("ACCEPTED");
        body["wasRead"] = json!(true);

        let invite = Typed::<FriendInvite>::new("FriendInvite")
            .validate(body)
            .unwrap();
        assert_eq!(invite.status, InviteStatus::Accepted);
        assert!(invite.was_read);
    }

    #[test]
    fn test_friend_invite_rejects_non_uuid_sender() {
        let mut body = invite_body();
        body["senderUserId"] = json!("not-a-uuid");

        let err = Typed::<FriendInvite>::new("FriendInvite")
            .validate(body)
            .unwrap_err();
        assert!(matches!(err, SchemaError::Shape { schema: "FriendInvite", .. }));
    }

    #[test]
    fn test_friend_invite_rejects_unknown_status() {
        let mut body = invite_body();
        body["status"] = json!("DECLINED");

        assert!(Typed::<FriendInvite>::new("FriendInvite")
            .validate(body)
            .is_err());
    }

    #[test]
    fn test_friend_invite_rejects_bad_timestamp() {
        let mut body = invite_body();
        body["requestSentAt"] = json!("yesterday");

        assert!(Typed::<FriendInvite>::new("FriendInvite")
            .validate(body)
            .is_err());
    }

    fn like_body(total_likes: Value) -> Value {
        json!({
            "postId": Uuid::new_v4(),
            "postAuthorId": RECEIVER,
            "likerUserId": SENDER,
            "totalLikes": total_likes,
        })
    }

    #[test]
    fn test_like_count_accepts_number_and_numeric_string() {
        let schema = Typed::<NewPostLike>::new("NewPostLike");

        assert_eq!(schema.validate(like_body(json!(12))).unwrap().total_likes, 12);
        assert_eq!(schema.validate(like_body(json!("12"))).unwrap().total_likes, 12);
    }

    #[test]
    fn test_like_count_rejects_garbage() {
        let schema = Typed::<NewPostLike>::new("NewPostLike");

        assert!(schema.validate(like_body(json!("twelve"))).is_err());
        assert!(schema.validate(like_body(json!(-1))).is_err());
        assert!(schema.validate(like_body(json!(null))).is_err());
    }

    fn comment_body() -> Value {
        json!({
            "postId": Uuid::new_v4(),
            "postAuthorId": RECEIVER,
            "commentAuthorId": SENDER,
            "commentContent": "nice post",
        })
    }

    #[test]
    fn test_comment_requires_content() {
        let mut body = comment_body();
        body["commentContent"] = json!("   ");

        let err = Typed::<NewPostComment>::new("NewPostComment")
            .validate(body)
            .unwrap_err();
        assert!(matches!(err, SchemaError::Field { field: "commentContent", .. }));
    }

    #[test]
    fn test_reply_without_parent_comment_id_is_accepted() {
        let mut body = comment_body();
        body["commentContent"] = json!("reply");
        body["parentCommentAuthorId"] = json!(SENDER);

        let comment = Typed::<NewPostComment>::new("NewPostComment")
            .validate(body)
            .unwrap();
        assert!(comment.parent_comment_id.is_none());

        let record = NotificationRecord::from(comment);
        assert_eq!(
            record.recipients(),
            vec![
                Uuid::parse_str(RECEIVER).unwrap(),
                Uuid::parse_str(SENDER).unwrap()
            ]
        );
    }

    #[test]
    fn test_comment_recipients_are_deduplicated() {
        let mut body = comment_body();
        body["parentCommentId"] = json!(Uuid::new_v4());
        body["parentCommentAuthorId"] = json!(RECEIVER);
        let comment = Typed::<NewPostComment>::new("NewPostComment")
            .validate(body)
            .unwrap();

        let record = NotificationRecord::from(comment);
        assert_eq!(record.recipients(), vec![Uuid::parse_str(RECEIVER).unwrap()]);
    }

    #[test]
    fn test_reply_notifies_post_and_parent_authors() {
        let mut body = comment_body();
        body["parentCommentId"] = json!(Uuid::new_v4());
        body["parentCommentAuthorId"] = json!(SENDER);
        let comment = Typed::<NewPostComment>::new("NewPostComment")
            .validate(body)
            .unwrap();

        let record = NotificationRecord::from(comment);
        assert_eq!(
            record.recipients(),
            vec![
                Uuid::parse_str(RECEIVER).unwrap(),
                Uuid::parse_str(SENDER).unwrap()
            ]
        );
    }

    #[test]
    fn test_record_payload_uses_wire_names() {
        let invite = Typed::<FriendInvite>::new("FriendInvite")
            .validate(invite_body())
            .unwrap();
        let record = NotificationRecord::from(invite);

        let payload = record.payload().unwrap();
        assert_eq!(payload["receiverUserId"], json!(RECEIVER));
        assert_eq!(payload["status"], json!("SENT"));
        assert_eq!(record.kind().as_str(), "friend_invite");
        assert!(!record.was_read());
    }
}
