//! Table layout and SQL statements of the staging store.

use rusqlite::Connection;

/// Drop every staging table.
pub(super) const DROP_TABLES: &str = "
    DROP TABLE IF EXISTS node;
    DROP TABLE IF EXISTS ways;
    DROP TABLE IF EXISTS relations;
";

/// Create the staging tables and their lookup indexes.
pub(super) const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS node (
        id INTEGER PRIMARY KEY,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        tags BLOB NOT NULL,
        propagate INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS ways (
        id INTEGER NOT NULL,
        node INTEGER NOT NULL,
        ord INTEGER NOT NULL,
        tags BLOB,
        boundary INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (id, ord)
    );
    CREATE TABLE IF NOT EXISTS relations (
        id INTEGER NOT NULL,
        member INTEGER NOT NULL,
        type INTEGER NOT NULL,
        role TEXT NOT NULL,
        ord INTEGER NOT NULL,
        tags BLOB,
        PRIMARY KEY (id, ord)
    );
    CREATE INDEX IF NOT EXISTS ways_id ON ways (id);
    CREATE INDEX IF NOT EXISTS ways_boundary ON ways (boundary);
    CREATE INDEX IF NOT EXISTS relations_id ON relations (id);
";

pub(super) const UPSERT_NODE: &str = "
    INSERT INTO node (id, latitude, longitude, tags, propagate)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT (id) DO UPDATE SET
        latitude = excluded.latitude,
        longitude = excluded.longitude,
        tags = excluded.tags,
        propagate = max(node.propagate, excluded.propagate)";

pub(super) const FLAG_NODE: &str = "UPDATE node SET propagate = 1 WHERE id = ?1";
pub(super) const UNFLAG_NODE: &str = "UPDATE node SET propagate = 0 WHERE id = ?1";

pub(super) const UPSERT_WAY_ROW: &str =
    "INSERT OR REPLACE INTO ways (id, node, ord, tags, boundary) VALUES (?1, ?2, ?3, ?4, ?5)";

pub(super) const UPSERT_RELATION_ROW: &str = "INSERT OR REPLACE INTO relations \
     (id, member, type, role, ord, tags) VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

pub(super) const DELETE_NODE: &str = "DELETE FROM node WHERE id = ?1";
pub(super) const DELETE_NODE_RANGE: &str = "DELETE FROM node WHERE id BETWEEN ?1 AND ?2";
pub(super) const DELETE_WAY: &str = "DELETE FROM ways WHERE id = ?1";
pub(super) const DELETE_RELATION: &str = "DELETE FROM relations WHERE id = ?1";

pub(super) const SELECT_NODE_LOCATION: &str =
    "SELECT latitude, longitude FROM node WHERE id = ?1";

pub(super) const SELECT_NODE_IDS: &str = "SELECT id FROM node";
pub(super) const SELECT_WAY_IDS: &str = "SELECT DISTINCT id FROM ways";
pub(super) const SELECT_RELATION_IDS: &str = "SELECT DISTINCT id FROM relations";

/// Create the tables, dropping existing ones first when `fresh`.
pub(super) fn initialise(connection: &Connection, fresh: bool) -> rusqlite::Result<()> {
    if fresh {
        connection.execute_batch(DROP_TABLES)?;
    }
    connection.execute_batch(CREATE_TABLES)
}
