pub mod ddl;
pub mod streamers;
pub mod streams;
