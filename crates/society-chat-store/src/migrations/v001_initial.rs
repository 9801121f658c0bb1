//! v001 -- Initial schema creation.
//!
//! Creates `direct_messages` and `hidden_messages` (per-user "delete for me").

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Direct messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS direct_messages (
    id          TEXT PRIMARY KEY NOT NULL,    -- UUID v4, minted on insert
    sender      TEXT NOT NULL,
    receiver    TEXT NOT NULL,
    society_id  TEXT NOT NULL,
    text        TEXT,
    file_url    TEXT,
    file_type   TEXT,
    audio_url   TEXT,
    created_at  TEXT NOT NULL,                -- RFC-3339
    seq         INTEGER NOT NULL,             -- insertion order tiebreak
    seen        INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1
    deleted     INTEGER NOT NULL DEFAULT 0    -- boolean 0/1, redacted for all
);

CREATE INDEX IF NOT EXISTS idx_dm_pair
    ON direct_messages(sender, receiver, seq);

CREATE INDEX IF NOT EXISTS idx_dm_unseen
    ON direct_messages(receiver, sender, seen);

-- ----------------------------------------------------------------
-- Messages a participant removed from their own view
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS hidden_messages (
    message_id  TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    hidden_at   TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES direct_messages(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
