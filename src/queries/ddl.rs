use sea_query::{ColumnDef, ForeignKey, ForeignKeyAction, Index, SqliteQueryBuilder, Table};

use crate::schema::{Streamers, Streams};

/// CREATE TABLE IF NOT EXISTS streamers (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     name TEXT NOT NULL UNIQUE,
///     max_quality TEXT NOT NULL DEFAULT 'best'
/// )
pub fn create_streamers_table() -> String {
    Table::create()
        .table(Streamers::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Streamers::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(ColumnDef::new(Streamers::Name).string().not_null().unique_key())
        .col(
            ColumnDef::new(Streamers::MaxQuality)
                .string()
                .not_null()
                .default("best"),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS streams (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     streamer_id INTEGER NOT NULL REFERENCES streamers(id) ON DELETE CASCADE,
///     url TEXT,
///     title TEXT,
///     category TEXT,
///     created_at INTEGER NOT NULL
/// )
pub fn create_streams_table() -> String {
    Table::create()
        .table(Streams::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Streams::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(ColumnDef::new(Streams::StreamerId).integer().not_null())
        .col(ColumnDef::new(Streams::Url).string())
        .col(ColumnDef::new(Streams::Title).string())
        .col(ColumnDef::new(Streams::Category).string())
        .col(ColumnDef::new(Streams::CreatedAt).big_integer().not_null())
        .foreign_key(
            ForeignKey::create()
                .from(Streams::Table, Streams::StreamerId)
                .to(Streamers::Table, Streamers::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_streams_created_at ON streams(created_at)
pub fn create_streams_created_at_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_streams_created_at")
        .table(Streams::Table)
        .col(Streams::CreatedAt)
        .to_string(SqliteQueryBuilder)
}

/// Every statement needed for an empty database, in execution order
pub fn all() -> Vec<String> {
    vec![
        create_streamers_table(),
        create_streams_table(),
        create_streams_created_at_index(),
    ]
}
