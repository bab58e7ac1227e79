use std::{collections::VecDeque, time::Duration};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::ClientError,
    jws,
    key::AccountKey,
    req::{http_client, req_expect_header, req_get, req_handle_error, req_head, req_post},
    util::read_json,
};

/// Attempts per signed request when the server keeps answering `badNonce`.
const MAX_BAD_NONCE_ATTEMPTS: usize = 3;

/// Default attempt budget for [`Transport::poll`].
pub const DEFAULT_POLL_LIMIT: usize = 4;

/// Default pause between [`Transport::poll`] attempts.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(500);

/// Signs requests with the account key and keeps the nonce cache warm.
///
/// Every response's `Replay-Nonce` is cached, so after the first exchange a signed request
/// normally needs no extra round trip.
#[derive(Debug)]
pub struct Transport {
    key: AccountKey,
    client: reqwest::Client,
    nonce_pool: NoncePool,
}

impl Transport {
    pub fn new(key: AccountKey) -> Self {
        Transport {
            key,
            client: http_client(),
            nonce_pool: NoncePool::default(),
        }
    }

    /// The key used in the transport
    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    /// Signs `body` for `url` and POSTs it.
    ///
    /// Non-2xx responses become [`ClientError::Problem`].
    pub async fn post<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            // Either get a new nonce, or reuse one from a previous request.
            let nonce = self.nonce_for(url).await?;

            let jws = jws::sign(&self.key, &nonce, url, body)?;
            let body_json = serde_json::to_string(&jws)?;

            log::debug!("Call endpoint: {url}");
            let response = req_post(&self.client, url, body_json).await?;

            // Regardless of the request being a success or not, there might be a nonce in the
            // response.
            self.nonce_pool.extract_nonce(&response);

            match req_handle_error(response).await {
                Ok(response) => return Ok(response),

                Err(problem) if problem.is_bad_nonce() && attempt < MAX_BAD_NONCE_ATTEMPTS => {
                    log::debug!("Retrying on bad nonce");
                }

                Err(problem) => return Err(problem.into()),
            }
        }
    }

    /// Plain GET; the response's nonce is kept.
    pub async fn get(&self, url: &str) -> eyre::Result<reqwest::Response> {
        let response = req_get(&self.client, url).await?;
        self.nonce_pool.extract_nonce(&response);
        Ok(req_handle_error(response).await?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> eyre::Result<T> {
        read_json(self.get(url).await?).await
    }

    pub async fn get_bytes(&self, url: &str) -> eyre::Result<Vec<u8>> {
        Ok(self.get(url).await?.bytes().await?.to_vec())
    }

    /// GETs `url` until `predicate` holds for the body, at most `limit` times.
    ///
    /// Fails with [`ClientError::PollLimitExceeded`] once the budget is spent.
    pub async fn poll<T, P>(
        &self,
        url: &str,
        predicate: P,
        limit: usize,
        delay: Duration,
    ) -> eyre::Result<T>
    where
        T: DeserializeOwned,
        P: Fn(&T) -> bool,
    {
        for attempt in 0..limit {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            let body = self.get_json::<T>(url).await?;

            if predicate(&body) {
                return Ok(body);
            }

            log::trace!("Poll attempt {} of {limit} for {url} not done", attempt + 1);
        }

        Err(ClientError::PollLimitExceeded {
            url: url.to_owned(),
            attempts: limit,
        }
        .into())
    }

    /// Number of nonces ready for use.
    pub fn cached_nonces(&self) -> usize {
        self.nonce_pool.pool.lock().len()
    }

    async fn nonce_for(&self, url: &str) -> eyre::Result<String> {
        if let Some(nonce) = self.nonce_pool.take() {
            log::trace!("Use previous nonce");
            return Ok(nonce);
        }

        log::debug!("Request new nonce");
        let res = req_head(&self.client, url).await?;

        req_expect_header(&res, "replay-nonce")
            .ok()
            .filter(|nonce| !nonce.is_empty())
            .ok_or_else(|| {
                ClientError::NoNonceAvailable {
                    url: url.to_owned(),
                }
                .into()
            })
    }
}

/// Nonces handed out by the server, oldest first.
#[derive(Default, Debug)]
struct NoncePool {
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    fn extract_nonce(&self, res: &reqwest::Response) {
        let Ok(nonce) = req_expect_header(res, "replay-nonce") else {
            return;
        };

        if nonce.is_empty() {
            return;
        }

        log::trace!("Extracting new nonce");

        let mut pool = self.pool.lock();
        pool.push_back(nonce);

        if pool.len() > 10 {
            pool.pop_front();
        }
    }

    fn take(&self) -> Option<String> {
        self.pool.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::{key::KeySpec, test::with_nonce_server};

    fn transport() -> Transport {
        Transport::new(AccountKey::generate(&KeySpec::p256()).unwrap())
    }

    #[tokio::test]
    async fn post_fetches_nonce_then_reuses_cache() {
        let server = with_nonce_server();
        let trans = transport();

        let res = trans
            .post(&server.url("/echo"), &serde_json::json!({"hello": "world"}))
            .await
            .unwrap();
        let body = res.json::<Value>().await.unwrap();
        assert_eq!(body["payload"], serde_json::json!({"hello": "world"}));
        assert_eq!(body["url"], server.url("/echo"));

        // HEAD for the first nonce, then the POST response replenished the cache
        assert_eq!(trans.cached_nonces(), 1);
        assert_eq!(server.heads(), 1);

        trans
            .post(&server.url("/echo"), &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(server.heads(), 1);
    }

    #[tokio::test]
    async fn missing_nonce_is_reported() {
        let server = with_nonce_server();
        let trans = transport();

        let err = trans
            .post(&server.url("/silent"), &serde_json::json!({}))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::NoNonceAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn problem_documents_surface_as_errors() {
        let server = with_nonce_server();
        let trans = transport();

        let err = trans
            .post(&server.url("/reject"), &serde_json::json!({}))
            .await
            .unwrap_err();

        let problem = err
            .downcast_ref::<ClientError>()
            .and_then(ClientError::problem)
            .unwrap();
        assert_eq!(problem.kind(), "unauthorized");
    }

    #[tokio::test]
    async fn get_keeps_response_nonce() {
        let server = with_nonce_server();
        let trans = transport();

        let body = trans.get_bytes(&server.url("/counter")).await.unwrap();
        assert_eq!(body, br#"{"count":1}"#);
        assert_eq!(trans.cached_nonces(), 1);

        trans
            .post(&server.url("/echo"), &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(server.heads(), 0);
    }

    #[tokio::test]
    async fn poll_returns_when_predicate_holds() {
        let server = with_nonce_server();
        let trans = transport();

        let body = trans
            .poll::<Value, _>(
                &server.url("/counter"),
                |body| body["count"].as_u64() >= Some(3),
                5,
                Duration::from_millis(1),
            )
            .await
            .unwrap();

        assert_eq!(body["count"], 3);
    }

    #[tokio::test]
    async fn poll_gives_up_after_limit() {
        let server = with_nonce_server();
        let trans = transport();

        let err = trans
            .poll::<Value, _>(
                &server.url("/counter"),
                |_| false,
                2,
                Duration::from_millis(1),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::PollLimitExceeded { attempts: 2, .. })
        ));
        assert_eq!(server.counter(), 2);

        let err = trans
            .poll::<Value, _>(&server.url("/counter"), |_| true, 0, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ClientError>().is_some());
        assert_eq!(server.counter(), 2);
    }
}
