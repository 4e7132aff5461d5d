use sea_query::{Expr, Order, Query, SelectStatement, SqliteQueryBuilder};

use crate::schema::{Streamers, Streams};

/// INSERT INTO streams (streamer_id, url, title, category, created_at)
/// VALUES (?, NULL, ?, ?, ?)
pub fn insert(
    streamer_id: i64,
    title: Option<&str>,
    category: Option<&str>,
    created_at_ms: i64,
) -> String {
    Query::insert()
        .into_table(Streams::Table)
        .columns([
            Streams::StreamerId,
            Streams::Url,
            Streams::Title,
            Streams::Category,
            Streams::CreatedAt,
        ])
        .values_panic([
            streamer_id.into(),
            Option::<String>::None.into(),
            title.map(str::to_string).into(),
            category.map(str::to_string).into(),
            created_at_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// UPDATE streams SET url = ? WHERE id = ?
pub fn update_url(id: i64, url: &str) -> String {
    Query::update()
        .table(Streams::Table)
        .value(Streams::Url, url)
        .and_where(Expr::col(Streams::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

fn select_columns() -> SelectStatement {
    Query::select()
        .columns([
            (Streams::Table, Streams::Id),
            (Streams::Table, Streams::StreamerId),
            (Streams::Table, Streams::Url),
            (Streams::Table, Streams::Title),
            (Streams::Table, Streams::Category),
            (Streams::Table, Streams::CreatedAt),
        ])
        .from(Streams::Table)
        .to_owned()
}

/// SELECT ... FROM streams WHERE id = ?
pub fn select_by_id(id: i64) -> String {
    select_columns()
        .and_where(Expr::col((Streams::Table, Streams::Id)).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT ... FROM streams [JOIN streamers ... WHERE streamers.name = ?]
/// ORDER BY created_at DESC, id DESC LIMIT ?
pub fn select_latest(streamer_name: Option<&str>, limit: u64) -> String {
    let mut query = select_columns();
    if let Some(name) = streamer_name {
        query
            .inner_join(
                Streamers::Table,
                Expr::col((Streams::Table, Streams::StreamerId))
                    .equals((Streamers::Table, Streamers::Id)),
            )
            .and_where(Expr::col((Streamers::Table, Streamers::Name)).eq(name));
    }
    query
        .order_by((Streams::Table, Streams::CreatedAt), Order::Desc)
        .order_by((Streams::Table, Streams::Id), Order::Desc)
        .limit(limit)
        .to_string(SqliteQueryBuilder)
}
