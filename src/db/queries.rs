pub const CREATE_ALERTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS alerts (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    situation TEXT NOT NULL,
    message TEXT NOT NULL,
    lat REAL,
    lon REAL,
    accuracy_m REAL,
    captured_at TEXT,
    created_at TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0,
    delivered_at TEXT,
    delivered_via TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
);
"#;

pub const CREATE_UNDELIVERED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_alerts_undelivered ON alerts (delivered, seq);
"#;

pub const INSERT_ALERT: &str = r#"
INSERT INTO alerts (
    alert_id, name, situation, message, lat, lon, accuracy_m, captured_at, created_at, delivered, delivered_at, delivered_via, retry_count
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13);
"#;

pub const MARK_DELIVERED: &str = r#"
UPDATE alerts
SET delivered = 1,
    delivered_at = ?2,
    delivered_via = ?3
WHERE alert_id = ?1 AND delivered = 0;
"#;

pub const INCREMENT_RETRY: &str = r#"
UPDATE alerts
SET retry_count = retry_count + 1
WHERE alert_id = ?1 AND delivered = 0;
"#;

pub const SELECT_ALERT: &str = r#"
SELECT * FROM alerts WHERE alert_id = ?1;
"#;

pub const SELECT_UNDELIVERED: &str = r#"
SELECT * FROM alerts WHERE delivered = 0 ORDER BY seq ASC;
"#;
