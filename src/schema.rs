use sea_query::Iden;

/// Streamers table - who to watch
#[derive(Iden)]
pub enum Streamers {
    Table,
    Id,
    Name,
    MaxQuality,
}

/// Streams table - one row per recording session
#[derive(Iden)]
pub enum Streams {
    Table,
    Id,
    StreamerId,
    Url,
    Title,
    Category,
    CreatedAt,
}
