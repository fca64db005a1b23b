//! SQLite 建表语句
//!
//! 六张表：`user_settings` / `user_personas` / `user_sessions` / `user_conversations` /
//! `user_persona_tokens` / `user_memories`。时间为 RFC 3339 文本，
//! `api_presets` 与 `embedding` 为 JSON 文本，`enabled_tools` 为逗号分隔字符串。

pub(crate) const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS user_settings (
    user_id         INTEGER PRIMARY KEY,
    api_key         TEXT,
    base_url        TEXT,
    model           TEXT,
    temperature     REAL,
    token_limit     INTEGER DEFAULT 0,
    current_persona TEXT DEFAULT 'default',
    enabled_tools   TEXT,
    tts_voice       TEXT,
    tts_style       TEXT,
    tts_endpoint    TEXT,
    api_presets     TEXT,
    title_model     TEXT
);

CREATE TABLE IF NOT EXISTS user_personas (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id            INTEGER NOT NULL,
    name               TEXT NOT NULL,
    system_prompt      TEXT NOT NULL,
    current_session_id INTEGER,
    UNIQUE (user_id, name)
);

CREATE TABLE IF NOT EXISTS user_sessions (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      INTEGER NOT NULL,
    persona_name TEXT NOT NULL,
    title        TEXT,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_owner ON user_sessions (user_id, persona_name);

CREATE TABLE IF NOT EXISTS user_conversations (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      INTEGER NOT NULL,
    persona_name TEXT NOT NULL,
    session_id   INTEGER,
    role         TEXT NOT NULL,
    content      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_session ON user_conversations (session_id);

CREATE TABLE IF NOT EXISTS user_persona_tokens (
    user_id           INTEGER NOT NULL,
    persona_name      TEXT NOT NULL,
    prompt_tokens     INTEGER DEFAULT 0,
    completion_tokens INTEGER DEFAULT 0,
    total_tokens      INTEGER DEFAULT 0,
    PRIMARY KEY (user_id, persona_name)
);

CREATE TABLE IF NOT EXISTS user_memories (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id   INTEGER NOT NULL,
    content   TEXT NOT NULL,
    source    TEXT DEFAULT 'user',
    embedding TEXT
);
CREATE INDEX IF NOT EXISTS idx_memories_user ON user_memories (user_id);
"#;
