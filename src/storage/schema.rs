//! Database schema definitions using sea-query.

use sea_query::Iden;

/// Notifications table schema.
#[derive(Iden)]
pub enum Notifications {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "kind"]
    Kind,
    #[iden = "recipient_ids"]
    RecipientIds,
    #[iden = "payload"]
    Payload,
    #[iden = "was_read"]
    WasRead,
    #[iden = "created_at"]
    CreatedAt,
}

/// One row per (notification, recipient), for per-user lookups.
#[derive(Iden)]
pub enum NotificationRecipients {
    Table,
    #[iden = "notification_id"]
    NotificationId,
    #[iden = "user_id"]
    UserId,
}

/// Sessions table schema. Rows are written by the session issuer.
#[derive(Iden)]
pub enum Sessions {
    Table,
    #[iden = "token"]
    Token,
    #[iden = "user_id"]
    UserId,
    #[iden = "issued_at"]
    IssuedAt,
    #[iden = "expires_at"]
    ExpiresAt,
}

/// SQL for creating the notifications table.
pub const CREATE_NOTIFICATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    recipient_ids TEXT NOT NULL,
    payload TEXT NOT NULL,
    was_read INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notifications_kind ON notifications(kind);

CREATE TABLE IF NOT EXISTS notification_recipients (
    notification_id TEXT NOT NULL REFERENCES notifications(id),
    user_id TEXT NOT NULL,
    PRIMARY KEY (notification_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_notification_recipients_user
    ON notification_recipients(user_id);
"#;

/// SQL for creating the sessions table.
pub const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    issued_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;
