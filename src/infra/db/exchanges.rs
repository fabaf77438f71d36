use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{FromRow, query, query_as, query_scalar};
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    application::repos::{ExchangeStore, RepoError, RequestSlot},
    cache::CanonicalRequest,
    domain::entities::{CapturedResponse, RequestRecord, ResponseRecord},
};

use super::{
    SqliteRepositories, map_sqlx_error,
    util::{from_unix_millis, status_from_db, to_unix_millis},
};

#[derive(FromRow)]
struct RequestRow {
    id: i64,
    scheme: String,
    host_and_port: String,
    path: String,
    method: String,
    headers: Vec<u8>,
    created_at_ms: i64,
    body: Option<Vec<u8>>,
}

impl TryFrom<RequestRow> for RequestRecord {
    type Error = RepoError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            scheme: row.scheme,
            host_and_port: row.host_and_port,
            path: row.path,
            method: row.method,
            headers: row.headers,
            created_at: from_unix_millis(row.created_at_ms)?,
            body: row.body,
        })
    }
}

#[derive(FromRow)]
struct ResponseRow {
    req_id: i64,
    status: i64,
    headers: Vec<u8>,
    created_at_ms: i64,
    body: Option<Vec<u8>>,
}

impl TryFrom<ResponseRow> for ResponseRecord {
    type Error = RepoError;

    fn try_from(row: ResponseRow) -> Result<Self, Self::Error> {
        Ok(Self {
            req_id: row.req_id,
            status: status_from_db(row.status)?,
            headers: row.headers,
            created_at: from_unix_millis(row.created_at_ms)?,
            body: row.body.map(Bytes::from).unwrap_or_default(),
        })
    }
}

impl SqliteRepositories {
    async fn find_request_id(&self, request: &CanonicalRequest) -> Result<i64, RepoError> {
        let key = &request.key;
        query_scalar::<_, i64>(
            "SELECT id FROM reqs \
             WHERE host_and_port = ? AND path = ? AND method = ? AND headers = ?",
        )
        .bind(&key.host_and_port)
        .bind(&key.path)
        .bind(&key.method)
        .bind(&key.headers)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    /// Load a request record by id.
    pub async fn fetch_request(&self, request_id: i64) -> Result<Option<RequestRecord>, RepoError> {
        let row = query_as::<_, RequestRow>(
            "SELECT id, scheme, host_and_port, path, method, headers, created_at_ms, body \
             FROM reqs WHERE id = ?",
        )
        .bind(request_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(RequestRecord::try_from).transpose()
    }

    pub async fn count_requests(&self) -> Result<u64, RepoError> {
        let count = query_scalar::<_, i64>("SELECT COUNT(*) FROM reqs")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        count
            .try_into()
            .map_err(|_| RepoError::from_persistence("count exceeds supported range"))
    }
}

#[async_trait]
impl ExchangeStore for SqliteRepositories {
    async fn get_or_create_request(
        &self,
        request: &CanonicalRequest,
    ) -> Result<RequestSlot, RepoError> {
        let key = &request.key;
        let inserted = query_scalar::<_, i64>(
            "INSERT INTO reqs (scheme, host_and_port, path, method, headers, created_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (host_and_port, path, method, headers) DO NOTHING \
             RETURNING id",
        )
        .bind(&request.scheme)
        .bind(&key.host_and_port)
        .bind(&key.path)
        .bind(&key.method)
        .bind(&key.headers)
        .bind(to_unix_millis(OffsetDateTime::now_utc()))
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error);

        match inserted {
            Ok(Some(id)) => Ok(RequestSlot { id, created: true }),
            Ok(None) | Err(RepoError::Duplicate { .. }) => {
                let id = self.find_request_id(request).await?;
                debug!(request_id = id, "request record already exists");
                Ok(RequestSlot { id, created: false })
            }
            Err(err) => Err(err),
        }
    }

    async fn get_response(&self, request_id: i64) -> Result<Option<ResponseRecord>, RepoError> {
        let row = query_as::<_, ResponseRow>(
            "SELECT req_id, status, headers, created_at_ms, body FROM resps WHERE req_id = ?",
        )
        .bind(request_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(ResponseRecord::try_from).transpose()
    }

    async fn put_response(
        &self,
        request_id: i64,
        response: &CapturedResponse,
    ) -> Result<(), RepoError> {
        query(
            "INSERT INTO resps (req_id, status, headers, created_at_ms, body) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(i64::from(response.status))
        .bind(response.headers.serialize())
        .bind(to_unix_millis(OffsetDateTime::now_utc()))
        .bind(response.body.as_ref())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn attach_request_body(&self, request_id: i64, body: &[u8]) -> Result<(), RepoError> {
        if body.is_empty() {
            return Ok(());
        }

        query("UPDATE reqs SET body = ? WHERE id = ? AND body IS NULL")
            .bind(body)
            .bind(request_id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn release_request(&self, request_id: i64) -> Result<(), RepoError> {
        query(
            "UPDATE reqs SET released = 1 \
             WHERE id = ? AND NOT EXISTS (SELECT 1 FROM resps WHERE resps.req_id = reqs.id)",
        )
        .bind(request_id)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn reclaim_request(
        &self,
        request_id: i64,
        stale_before: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Result<bool, RepoError> {
        // A NULL bound makes the age test false, leaving only released records eligible.
        let result = query(
            "UPDATE reqs SET created_at_ms = ?, released = 0 \
             WHERE id = ? AND (released = 1 OR created_at_ms < ?) \
             AND NOT EXISTS (SELECT 1 FROM resps WHERE resps.req_id = reqs.id)",
        )
        .bind(to_unix_millis(now))
        .bind(request_id)
        .bind(stale_before.map(to_unix_millis))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use sqlx::SqlitePool;

    use super::*;
    use crate::domain::headers::HeaderMultimap;

    fn request(path: &str, headers: &[(&str, &str)]) -> CanonicalRequest {
        let mut multimap = HeaderMultimap::new();
        for (name, value) in headers {
            multimap.append(name, value);
        }
        CanonicalRequest::new("http", "example.com", Some(8080), path, "GET", &multimap)
    }

    fn response(status: u16, body: &'static [u8]) -> CapturedResponse {
        let mut headers = HeaderMultimap::new();
        headers.append("Content-Type", "text/plain");
        CapturedResponse {
            status,
            headers,
            body: Bytes::from_static(body),
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn concurrent_get_or_create_yields_single_owner(pool: SqlitePool) {
        let repos = Arc::new(SqliteRepositories::new(pool));
        let key = request("/race", &[("Accept", "*/*")]);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repos = Arc::clone(&repos);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                repos.get_or_create_request(&key).await
            }));
        }

        let mut slots = Vec::new();
        for handle in handles {
            slots.push(handle.await.expect("join").expect("slot"));
        }

        assert_eq!(slots.iter().filter(|slot| slot.created).count(), 1);
        assert!(slots.iter().all(|slot| slot.id == slots[0].id));
        assert_eq!(repos.count_requests().await.expect("count"), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn scheme_is_stored_but_not_part_of_identity(pool: SqlitePool) {
        let repos = SqliteRepositories::new(pool);
        let plain = request("/scheme", &[]);
        let mut secure = plain.clone();
        secure.scheme = "https".to_string();

        let first = repos.get_or_create_request(&plain).await.expect("first");
        let second = repos.get_or_create_request(&secure).await.expect("second");

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);

        let record = repos
            .fetch_request(first.id)
            .await
            .expect("fetch")
            .expect("record exists");
        assert_eq!(record.scheme, "http");
        assert_eq!(record.host_and_port, "example.com:8080");
        assert!(record.body.is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn differing_header_values_create_distinct_records(pool: SqlitePool) {
        let repos = SqliteRepositories::new(pool);

        let one = repos
            .get_or_create_request(&request("/foo", &[("A", "1")]))
            .await
            .expect("one");
        let two = repos
            .get_or_create_request(&request("/foo", &[("A", "2")]))
            .await
            .expect("two");

        assert!(one.created && two.created);
        assert_ne!(one.id, two.id);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn response_is_written_once(pool: SqlitePool) {
        let repos = SqliteRepositories::new(pool);
        let slot = repos
            .get_or_create_request(&request("/once", &[]))
            .await
            .expect("slot");

        assert!(repos.get_response(slot.id).await.expect("read").is_none());
        repos
            .put_response(slot.id, &response(200, b"first"))
            .await
            .expect("first write");

        let err = repos
            .put_response(slot.id, &response(500, b"second"))
            .await
            .expect_err("second write must fail");
        assert!(matches!(err, RepoError::Duplicate { .. }));

        let stored = repos
            .get_response(slot.id)
            .await
            .expect("read")
            .expect("stored");
        assert_eq!(stored.status, 200);
        assert_eq!(stored.body, Bytes::from_static(b"first"));
        assert_eq!(stored.headers, b"Content-Type: text/plain\r\n");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn empty_response_body_reads_back_empty(pool: SqlitePool) {
        let repos = SqliteRepositories::new(pool);
        let slot = repos
            .get_or_create_request(&request("/empty", &[]))
            .await
            .expect("slot");

        repos
            .put_response(slot.id, &response(204, b""))
            .await
            .expect("write");
        let stored = repos
            .get_response(slot.id)
            .await
            .expect("read")
            .expect("stored");
        assert_eq!(stored.status, 204);
        assert!(stored.body.is_empty());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn request_body_attaches_once_and_ignores_empty(pool: SqlitePool) {
        let repos = SqliteRepositories::new(pool);
        let slot = repos
            .get_or_create_request(&request("/upload", &[]))
            .await
            .expect("slot");

        repos
            .attach_request_body(slot.id, b"")
            .await
            .expect("empty attach");
        let record = repos.fetch_request(slot.id).await.expect("fetch").expect("record");
        assert!(record.body.is_none());

        repos
            .attach_request_body(slot.id, b"payload")
            .await
            .expect("attach");
        repos
            .attach_request_body(slot.id, b"other")
            .await
            .expect("second attach");
        let record = repos.fetch_request(slot.id).await.expect("fetch").expect("record");
        assert_eq!(record.body.as_deref(), Some(&b"payload"[..]));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn reclaim_only_succeeds_for_stale_unanswered_records(pool: SqlitePool) {
        let repos = SqliteRepositories::new(pool);
        let slot = repos
            .get_or_create_request(&request("/lease", &[]))
            .await
            .expect("slot");
        let now = OffsetDateTime::now_utc();

        let fresh = repos
            .reclaim_request(slot.id, Some(now - Duration::from_secs(60)), now)
            .await
            .expect("reclaim");
        assert!(!fresh, "record younger than the lease must not be reclaimed");

        let later = now + Duration::from_secs(120);
        let first = repos
            .reclaim_request(slot.id, Some(later - Duration::from_secs(60)), later)
            .await
            .expect("reclaim");
        let second = repos
            .reclaim_request(slot.id, Some(later - Duration::from_secs(60)), later)
            .await
            .expect("reclaim");
        assert!(first);
        assert!(!second, "refreshed attempt must not be reclaimed twice");

        repos
            .put_response(slot.id, &response(200, b"done"))
            .await
            .expect("write");
        let much_later = later + Duration::from_secs(3600);
        let answered = repos
            .reclaim_request(slot.id, Some(much_later), much_later)
            .await
            .expect("reclaim");
        assert!(!answered, "answered records are never reclaimed");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn released_record_is_reclaimed_once_without_lease(pool: SqlitePool) {
        let repos = SqliteRepositories::new(pool);
        let slot = repos
            .get_or_create_request(&request("/retry", &[]))
            .await
            .expect("slot");
        let now = OffsetDateTime::now_utc();

        let pending = repos
            .reclaim_request(slot.id, None, now)
            .await
            .expect("reclaim");
        assert!(!pending, "an attempt in progress is not reclaimable without a lease");

        repos.release_request(slot.id).await.expect("release");
        let first = repos
            .reclaim_request(slot.id, None, now)
            .await
            .expect("reclaim");
        let second = repos
            .reclaim_request(slot.id, None, now)
            .await
            .expect("reclaim");
        assert!(first);
        assert!(!second, "reclaiming clears the released mark");

        repos
            .put_response(slot.id, &response(200, b"done"))
            .await
            .expect("write");
        repos.release_request(slot.id).await.expect("release");
        let answered = repos
            .reclaim_request(slot.id, None, now)
            .await
            .expect("reclaim");
        assert!(!answered, "answered records are never released");
    }
}
