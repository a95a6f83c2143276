//! Binding [`QueryParam`] values onto sqlx queries.
//!
//! Every bound value goes through [`BindParams`]; SQL text never carries
//! caller data.

use crate::models::QueryParam;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

/// A backend query that accepts [`QueryParam`] values in placeholder order.
pub(crate) trait BindParams<'q>: Sized {
    fn bind_param(self, param: &'q QueryParam) -> Self;

    fn bind_all(self, params: &'q [QueryParam]) -> Self {
        params.iter().fold(self, Self::bind_param)
    }
}

impl<'q> BindParams<'q> for Query<'q, MySql, MySqlArguments> {
    fn bind_param(self, param: &'q QueryParam) -> Self {
        match param {
            QueryParam::Null => self.bind(None::<String>),
            QueryParam::Bool(v) => self.bind(*v),
            QueryParam::Int(v) => self.bind(*v),
            QueryParam::Float(v) => self.bind(*v),
            QueryParam::String(v) => self.bind(v.as_str()),
            QueryParam::Bytes(v) => self.bind(v.as_slice()),
            QueryParam::Json(v) => self.bind(Json(v)),
        }
    }
}

impl<'q> BindParams<'q> for Query<'q, Postgres, PgArguments> {
    fn bind_param(self, param: &'q QueryParam) -> Self {
        match param {
            QueryParam::Null => self.bind(None::<String>),
            QueryParam::Bool(v) => self.bind(*v),
            QueryParam::Int(v) => self.bind(*v),
            QueryParam::Float(v) => self.bind(*v),
            QueryParam::String(v) => self.bind(v.as_str()),
            QueryParam::Bytes(v) => self.bind(v.as_slice()),
            // jsonb
            QueryParam::Json(v) => self.bind(Json(v)),
        }
    }
}

impl<'q> BindParams<'q> for Query<'q, Sqlite, SqliteArguments<'q>> {
    fn bind_param(self, param: &'q QueryParam) -> Self {
        match param {
            QueryParam::Null => self.bind(None::<String>),
            QueryParam::Bool(v) => self.bind(*v),
            QueryParam::Int(v) => self.bind(*v),
            QueryParam::Float(v) => self.bind(*v),
            QueryParam::String(v) => self.bind(v.as_str()),
            QueryParam::Bytes(v) => self.bind(v.as_slice()),
            // No JSON column type; stored as TEXT
            QueryParam::Json(v) => self.bind(v.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::Row;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_sqlite_binds_every_variant_in_order() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let params = vec![
            QueryParam::Null,
            QueryParam::Bool(true),
            QueryParam::Int(-7),
            QueryParam::Float(2.5),
            QueryParam::String("saga".into()),
            QueryParam::Bytes(vec![1, 2, 3]),
            QueryParam::Json(json!({"k": [1]})),
        ];

        let row = sqlx::query("SELECT ? AS n, ? AS b, ? AS i, ? AS f, ? AS s, ? AS raw, ? AS j")
            .bind_all(&params)
            .fetch_one(&pool)
            .await
            .unwrap();

        assert_eq!(row.get::<Option<String>, _>("n"), None);
        assert!(row.get::<bool, _>("b"));
        assert_eq!(row.get::<i64, _>("i"), -7);
        assert_eq!(row.get::<f64, _>("f"), 2.5);
        assert_eq!(row.get::<String, _>("s"), "saga");
        assert_eq!(row.get::<Vec<u8>, _>("raw"), vec![1, 2, 3]);
        assert_eq!(row.get::<String, _>("j"), r#"{"k":[1]}"#);
    }
}
