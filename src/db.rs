use rusqlite::Connection;
use std::path::Path;

pub const DB_FILENAME: &str = "evald.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILENAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marking_schemas(
            id TEXT PRIMARY KEY,
            school TEXT NOT NULL,
            department TEXT NOT NULL,
            requires_contribution INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            UNIQUE(school, department)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_reviews(
            id TEXT PRIMARY KEY,
            schema_id TEXT NOT NULL,
            review_name TEXT NOT NULL,
            display_name TEXT NOT NULL,
            faculty_type TEXT NOT NULL,
            deadline_from TEXT,
            deadline_to TEXT,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(schema_id) REFERENCES marking_schemas(id),
            UNIQUE(schema_id, review_name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schema_reviews_schema ON schema_reviews(schema_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_components(
            id TEXT PRIMARY KEY,
            review_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(review_id) REFERENCES schema_reviews(id),
            UNIQUE(review_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schema_components_review ON schema_components(review_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            reg_no TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            school TEXT NOT NULL,
            department TEXT NOT NULL,
            pat INTEGER NOT NULL DEFAULT 0,
            ppt_approved INTEGER NOT NULL DEFAULT 0,
            ppt_locked INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_owner ON students(school, department)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS review_entries(
            id TEXT PRIMARY KEY,
            reg_no TEXT NOT NULL,
            review_name TEXT NOT NULL,
            comments TEXT NOT NULL DEFAULT '',
            attendance_value INTEGER NOT NULL DEFAULT 0,
            attendance_locked INTEGER NOT NULL DEFAULT 0,
            locked INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(reg_no) REFERENCES students(reg_no),
            UNIQUE(reg_no, review_name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_review_entries_student ON review_entries(reg_no)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS entry_marks(
            entry_id TEXT NOT NULL,
            component_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            value REAL,
            PRIMARY KEY(entry_id, component_name),
            FOREIGN KEY(entry_id) REFERENCES review_entries(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entry_marks_entry ON entry_marks(entry_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS deadline_overrides(
            reg_no TEXT NOT NULL,
            review_type TEXT NOT NULL,
            deadline_from TEXT,
            deadline_to TEXT,
            PRIMARY KEY(reg_no, review_type),
            FOREIGN KEY(reg_no) REFERENCES students(reg_no)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS deadline_requests(
            id TEXT PRIMARY KEY,
            reg_no TEXT NOT NULL,
            review_type TEXT NOT NULL,
            faculty_type TEXT NOT NULL,
            comments TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            requested_at TEXT NOT NULL,
            resolved_at TEXT,
            new_deadline_from TEXT,
            new_deadline_to TEXT,
            FOREIGN KEY(reg_no) REFERENCES students(reg_no)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_deadline_requests_student ON deadline_requests(reg_no)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_deadline_requests_status ON deadline_requests(status)",
        [],
    )?;

    // Existing workspaces may predate the attendance lock column. Add if needed.
    ensure_entries_attendance_locked(&conn)?;

    Ok(conn)
}

fn ensure_entries_attendance_locked(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "review_entries", "attendance_locked")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE review_entries ADD COLUMN attendance_locked INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
