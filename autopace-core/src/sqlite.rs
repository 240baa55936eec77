use rusqlite::{Connection, OpenFlags};

/// Read-only connections leave the journal mode alone; only a writer may switch it.
pub fn configure_connection(conn: &Connection, flags: OpenFlags) -> rusqlite::Result<()> {
    if !flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY) {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    }
    conn.execute_batch(
        "PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}
