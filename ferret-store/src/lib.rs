//! SQLite-backed storage for captured requests.

use std::path::Path;

use chrono::{
    DateTime,
    Utc,
};
use ferret::{
    record::is_supported_method,
    CapturedRequest,
    Scheme,
};
use sqlx::{
    sqlite::{
        SqliteConnectOptions,
        SqlitePoolOptions,
        SqliteRow,
    },
    QueryBuilder,
    Row,
    Sqlite,
};

/// How many requests a listing returns when no limit is given.
pub const DEFAULT_LIMIT: i64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sqlx error")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("no request with id {id}")]
    NotFound { id: i64 },

    #[error("request {id} has an invalid scheme")]
    InvalidScheme { id: i64 },
}

/// Filters for [`RequestStore::get_requests`].
///
/// Filter values arrive as untrusted strings; values that don't pass
/// validation are ignored rather than interpolated into the query. All
/// values that do apply are bound as parameters.
#[derive(Clone, Debug)]
pub struct RequestFilter {
    pub scheme: Option<String>,
    pub method: Option<String>,
    pub host: Option<String>,
    pub limit: Option<i64>,
    pub newest_first: bool,
}

impl Default for RequestFilter {
    fn default() -> Self {
        Self {
            scheme: None,
            method: None,
            host: None,
            limit: None,
            newest_first: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RequestStore {
    pool: sqlx::SqlitePool,
}

impl RequestStore {
    pub async fn in_memory() -> Result<Self, Error> {
        // a single connection, kept open: an in-memory database lives and
        // dies with its connection
        Self::open_with(
            SqliteConnectOptions::new(),
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1),
        )
        .await
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with(
            SqliteConnectOptions::new().filename(path),
            SqlitePoolOptions::new(),
        )
        .await
    }

    pub async fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
            SqlitePoolOptions::new(),
        )
        .await
    }

    async fn open_with(
        options: SqliteConnectOptions,
        pool_options: SqlitePoolOptions,
    ) -> Result<Self, Error> {
        let pool = pool_options.connect_with(options).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Inserts a record and returns it with its assigned id and timestamp.
    pub async fn create_request(&self, record: &CapturedRequest) -> Result<CapturedRequest, Error> {
        let mut record = record.clone();
        record.method = record.method.to_uppercase();
        record.rebuild_header_raw();

        let row = sqlx::query(
            r#"
            INSERT INTO request (method, scheme, address, header, body, userlogin, userpassword)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id, created_at
            "#,
        )
        .bind(&record.method)
        .bind(record.scheme.as_str())
        .bind(&record.host)
        .bind(&record.header_raw)
        .bind(&record.body)
        .bind(&record.user_login)
        .bind(&record.user_password)
        .fetch_one(&self.pool)
        .await?;

        record.id = Some(row.try_get("id")?);
        record.created_at = Some(row.try_get::<DateTime<Utc>, _>("created_at")?);

        Ok(record)
    }

    pub async fn get_requests(&self, filter: &RequestFilter) -> Result<Vec<CapturedRequest>, Error> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, method, scheme, address, header, body, userlogin, userpassword, created_at \
             FROM request WHERE 1 = 1",
        );

        if let Some(scheme) = filter
            .scheme
            .as_deref()
            .and_then(|scheme| scheme.parse::<Scheme>().ok())
        {
            query.push(" AND scheme = ").push_bind(scheme.as_str());
        }

        if let Some(method) = filter
            .method
            .as_deref()
            .filter(|method| is_supported_method(method))
        {
            query
                .push(" AND method = ")
                .push_bind(method.to_uppercase());
        }

        if let Some(host) = filter
            .host
            .as_deref()
            .filter(|host| !host.is_empty() && !host.contains('\'') && !host.contains(';'))
        {
            query
                .push(" AND instr(lower(address), lower(")
                .push_bind(host.to_owned())
                .push(")) > 0");
        }

        query.push(if filter.newest_first {
            " ORDER BY id DESC"
        }
        else {
            " ORDER BY id ASC"
        });

        query
            .push(" LIMIT ")
            .push_bind(filter.limit.unwrap_or(DEFAULT_LIMIT));

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn get_request(&self, id: i64) -> Result<CapturedRequest, Error> {
        let row = sqlx::query(
            r#"
            SELECT id, method, scheme, address, header, body, userlogin, userpassword, created_at
            FROM request
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound { id })?;

        record_from_row(&row)
    }

    /// Deletes the whole history and returns how many records went away.
    pub async fn delete_requests(&self) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM request")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<CapturedRequest, Error> {
    let id: i64 = row.try_get("id")?;

    let scheme: String = row.try_get("scheme")?;
    let scheme = scheme
        .parse()
        .map_err(|_| Error::InvalidScheme { id })?;

    let mut record = CapturedRequest {
        id: Some(id),
        method: row.try_get("method")?,
        scheme,
        host: row.try_get("address")?,
        header_raw: row.try_get("header")?,
        body: row.try_get("body")?,
        user_login: row.try_get("userlogin")?,
        user_password: row.try_get("userpassword")?,
        created_at: Some(row.try_get("created_at")?),
        ..Default::default()
    };
    record.rebuild_headers();

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(method: &str, scheme: Scheme, host: &str) -> CapturedRequest {
        let mut record = CapturedRequest {
            method: method.to_owned(),
            scheme,
            host: host.to_owned(),
            headers: [("Host".to_owned(), host.to_owned())].into_iter().collect(),
            body: b"body".to_vec(),
            ..Default::default()
        };
        record.rebuild_header_raw();
        record
    }

    #[tokio::test]
    async fn created_requests_come_back_intact() {
        let store = RequestStore::in_memory().await.unwrap();

        let record = sample("get", Scheme::Https, "example.com:443");
        let created = store.create_request(&record).await.unwrap();

        let id = created.id.unwrap();
        assert!(created.created_at.is_some());
        // methods normalize to upper case on insert
        assert_eq!(created.method, "GET");

        let fetched = store.get_request(id).await.unwrap();
        assert_eq!(fetched.method, "GET");
        assert_eq!(fetched.scheme, Scheme::Https);
        assert_eq!(fetched.host, "example.com:443");
        assert_eq!(fetched.headers["Host"], "example.com:443");
        assert_eq!(fetched.body, b"body");
    }

    #[tokio::test]
    async fn missing_requests_are_not_found() {
        let store = RequestStore::in_memory().await.unwrap();
        assert!(matches!(
            store.get_request(42).await,
            Err(Error::NotFound { id: 42 })
        ));
    }

    #[tokio::test]
    async fn listing_filters_by_scheme_method_and_host() {
        let store = RequestStore::in_memory().await.unwrap();

        store
            .create_request(&sample("GET", Scheme::Https, "a.example.com"))
            .await
            .unwrap();
        store
            .create_request(&sample("POST", Scheme::Http, "b.example.com"))
            .await
            .unwrap();
        store
            .create_request(&sample("GET", Scheme::Http, "b.example.com"))
            .await
            .unwrap();

        let by_scheme = store
            .get_requests(&RequestFilter {
                scheme: Some("https".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_scheme.len(), 1);
        assert_eq!(by_scheme[0].host, "a.example.com");

        let by_method = store
            .get_requests(&RequestFilter {
                method: Some("post".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_method.len(), 1);
        assert_eq!(by_method[0].method, "POST");

        let by_host = store
            .get_requests(&RequestFilter {
                host: Some("B.EXAMPLE".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_host.len(), 2);
    }

    #[tokio::test]
    async fn hostile_filter_values_do_not_reach_the_query() {
        let store = RequestStore::in_memory().await.unwrap();
        store
            .create_request(&sample("GET", Scheme::Https, "example.com"))
            .await
            .unwrap();

        let listed = store
            .get_requests(&RequestFilter {
                scheme: Some("https'; DROP TABLE request; --".to_owned()),
                method: Some("GET'; DROP TABLE request; --".to_owned()),
                host: Some("'; DROP TABLE request; --".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();

        // the hostile filters are ignored, not applied
        assert_eq!(listed.len(), 1);

        // and the table is still there
        let all = store.get_requests(&RequestFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn listing_orders_and_limits() {
        let store = RequestStore::in_memory().await.unwrap();
        for host in ["one", "two", "three"] {
            store
                .create_request(&sample("GET", Scheme::Http, host))
                .await
                .unwrap();
        }

        let newest_first = store.get_requests(&RequestFilter::default()).await.unwrap();
        assert_eq!(newest_first[0].host, "three");

        let oldest_first = store
            .get_requests(&RequestFilter {
                newest_first: false,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(oldest_first[0].host, "one");

        let limited = store
            .get_requests(&RequestFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn deleting_clears_the_history() {
        let store = RequestStore::in_memory().await.unwrap();
        for _ in 0..3 {
            store
                .create_request(&sample("GET", Scheme::Http, "example.com"))
                .await
                .unwrap();
        }

        assert_eq!(store.delete_requests().await.unwrap(), 3);
        assert!(store
            .get_requests(&RequestFilter::default())
            .await
            .unwrap()
            .is_empty());
    }
}
