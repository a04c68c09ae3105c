//! Parameter binding for the sqlx adapter.
//!
//! Binds `QueryParam` values to database-specific query objects.

use crate::models::QueryParam;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

macro_rules! bind_param {
    ($query:expr, $param:expr) => {
        match $param {
            QueryParam::Null => $query.bind(None::<String>),
            QueryParam::Bool(v) => $query.bind(*v),
            QueryParam::Int(v) => $query.bind(*v),
            QueryParam::Float(v) => $query.bind(*v),
            QueryParam::String(v) => $query.bind(v.as_str()),
            QueryParam::Bytes(v) => $query.bind(v.as_slice()),
        }
    };
}

pub(crate) fn mysql_query<'q>(
    sql: &'q str,
    params: &'q [QueryParam],
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| bind_param!(query, param))
}

pub(crate) fn postgres_query<'q>(
    sql: &'q str,
    params: &'q [QueryParam],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| bind_param!(query, param))
}

pub(crate) fn sqlite_query<'q>(
    sql: &'q str,
    params: &'q [QueryParam],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| bind_param!(query, param))
}
