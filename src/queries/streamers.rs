use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::Streamers;

/// SELECT id, name, max_quality FROM streamers ORDER BY id
pub fn select_all() -> String {
    Query::select()
        .columns([Streamers::Id, Streamers::Name, Streamers::MaxQuality])
        .from(Streamers::Table)
        .order_by(Streamers::Id, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, name, max_quality FROM streamers WHERE name = ?
pub fn select_by_name(name: &str) -> String {
    Query::select()
        .columns([Streamers::Id, Streamers::Name, Streamers::MaxQuality])
        .from(Streamers::Table)
        .and_where(Expr::col(Streamers::Name).eq(name))
        .to_string(SqliteQueryBuilder)
}

/// INSERT INTO streamers (name, max_quality) VALUES (?, ?)
pub fn insert(name: &str, max_quality: &str) -> String {
    Query::insert()
        .into_table(Streamers::Table)
        .columns([Streamers::Name, Streamers::MaxQuality])
        .values_panic([name.into(), max_quality.into()])
        .to_string(SqliteQueryBuilder)
}

/// UPDATE streamers SET max_quality = ? WHERE name = ?
pub fn update_quality(name: &str, max_quality: &str) -> String {
    Query::update()
        .table(Streamers::Table)
        .value(Streamers::MaxQuality, max_quality)
        .and_where(Expr::col(Streamers::Name).eq(name))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM streamers WHERE name = ?
pub fn delete_by_name(name: &str) -> String {
    Query::delete()
        .from_table(Streamers::Table)
        .and_where(Expr::col(Streamers::Name).eq(name))
        .to_string(SqliteQueryBuilder)
}
