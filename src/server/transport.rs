//! Request authentication for the server routes.
//!
//! Every response leaving a [`TransportServer::scope`] carries a fresh `Replay-Nonce`. POST
//! handlers take a [`Signed`] payload, which only extracts once the envelope's signature, nonce
//! and target URL have all been checked.

use std::{future::Future, pin::Pin, sync::Arc};

use actix_web::{
    body::BoxBody,
    dev::{Payload, Service as _, ServiceFactory, ServiceRequest, ServiceResponse},
    http::header::{HeaderName, HeaderValue},
    web, FromRequest, HttpRequest, HttpResponse, Scope,
};
use serde::de::DeserializeOwned;

use super::ServerError;
use crate::{
    jws::{self, FlattenedJsonJws, Jwk},
    nonce::NonceSource,
};

pub const REPLAY_NONCE: &str = "replay-nonce";

#[derive(Debug, Default)]
pub struct TransportServer {
    nonces: NonceSource,
}

impl TransportServer {
    pub fn new(nonces: NonceSource) -> Self {
        TransportServer { nonces }
    }

    pub fn nonces(&self) -> &NonceSource {
        &self.nonces
    }

    /// A scope at `path` that stamps a nonce on every response, including unmatched routes.
    pub fn scope(
        self: &Arc<Self>,
        path: &str,
    ) -> Scope<
        impl ServiceFactory<
            ServiceRequest,
            Config = (),
            Response = ServiceResponse<BoxBody>,
            Error = actix_web::Error,
            InitError = (),
        >,
    > {
        let transport = Arc::clone(self);

        web::scope(path)
            .app_data(web::Data::from(Arc::clone(self)))
            .default_service(web::to(HttpResponse::NotFound))
            .wrap_fn(move |req, srv| {
                let nonce = transport.nonces.issue();
                let res = srv.call(req);

                async move {
                    let mut res = res.await?;

                    if let Ok(nonce) = HeaderValue::from_str(&nonce) {
                        res.headers_mut()
                            .insert(HeaderName::from_static(REPLAY_NONCE), nonce);
                    }

                    Ok(res)
                }
            })
    }

    fn authenticate<T: DeserializeOwned>(
        &self,
        req: &HttpRequest,
        body: &[u8],
    ) -> Result<Signed<T>, ServerError> {
        let envelope = serde_json::from_slice::<FlattenedJsonJws>(body)
            .map_err(|err| ServerError::malformed_because("Request body is not a JWS", err))?;

        let verified = jws::verify(&envelope).map_err(|err| {
            log::warn!("Rejecting request to {}: {err}", req.path());
            ServerError::from(err)
        })?;

        if !self.nonces.consume(&verified.header.nonce) {
            log::warn!("Rejecting nonce {:?}", verified.header.nonce);
            return Err(ServerError::BadNonce);
        }

        let actual = request_url(req);
        if !same_target(&verified.header.url, &actual) {
            log::warn!("JWS url {} does not match {actual}", verified.header.url);
            return Err(ServerError::malformed_because(
                "URL in JWS header does not match request",
                format!("expected {actual}"),
            ));
        }

        let thumbprint = verified.thumbprint();

        let payload = serde_json::from_value::<T>(verified.payload)
            .map_err(|err| ServerError::malformed_because("Invalid request payload", err))?;

        Ok(Signed {
            payload,
            jwk: verified.header.jwk,
            thumbprint,
            url: verified.header.url,
        })
    }
}

/// The URL this request was sent to, as seen by the client.
pub(crate) fn request_url(req: &HttpRequest) -> String {
    let info = req.connection_info();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("{}://{}{path}", info.scheme(), info.host())
}

/// Scheme, host, effective port, path and query must all agree.
fn same_target(claimed: &str, actual: &str) -> bool {
    let (Ok(claimed), Ok(actual)) = (url::Url::parse(claimed), url::Url::parse(actual)) else {
        return false;
    };

    claimed.scheme() == actual.scheme()
        && claimed.host_str() == actual.host_str()
        && claimed.port_or_known_default() == actual.port_or_known_default()
        && claimed.path() == actual.path()
        && claimed.query() == actual.query()
}

/// An authenticated request payload.
#[derive(Debug, Clone)]
pub struct Signed<T> {
    pub payload: T,

    /// The caller's public key.
    pub jwk: Jwk,

    /// Thumbprint of [`jwk`](Self::jwk); identifies the caller.
    pub thumbprint: String,

    pub url: String,
}

impl<T: DeserializeOwned + 'static> FromRequest for Signed<T> {
    type Error = ServerError;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let body = web::Bytes::from_request(&req, payload);

        Box::pin(async move {
            let body = body
                .await
                .map_err(|err| ServerError::malformed_because("Unable to read request body", err))?;

            let transport = req
                .app_data::<web::Data<TransportServer>>()
                .ok_or_else(|| ServerError::Internal("transport is not configured".to_owned()))?;

            transport.authenticate(&req, &body)
        })
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test, App};
    use serde_json::{json, Value};

    use super::*;
    use crate::key::{AccountKey, KeySpec};

    async fn echo(signed: Signed<Value>) -> HttpResponse {
        HttpResponse::Ok().json(json!({
            "payload": signed.payload,
            "thumbprint": signed.thumbprint,
        }))
    }

    fn signed_body(key: &AccountKey, nonce: &str, url: &str, payload: &Value) -> String {
        serde_json::to_string(&jws::sign(key, nonce, url, payload).unwrap()).unwrap()
    }

    macro_rules! app {
        ($transport:expr) => {
            test::init_service(
                App::new().service(
                    $transport
                        .scope("")
                        .route("/echo", web::post().to(echo))
                        .route("/plain", web::get().to(HttpResponse::Ok)),
                ),
            )
            .await
        };
    }

    fn post(body: String) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/echo")
            .insert_header(("host", "example.com"))
            .set_payload(body)
    }

    #[actix_web::test]
    async fn every_response_carries_a_nonce() {
        let transport = Arc::new(TransportServer::default());
        let app = app!(transport);

        for req in [
            test::TestRequest::get().uri("/plain"),
            test::TestRequest::get().uri("/missing"),
            test::TestRequest::default()
                .method(actix_web::http::Method::HEAD)
                .uri("/echo"),
        ] {
            let res = test::call_service(&app, req.to_request()).await;
            let nonce = res.headers().get(REPLAY_NONCE).unwrap().to_str().unwrap();
            assert!(transport.nonces().consume(nonce));
        }

        let res = test::call_service(&app, test::TestRequest::get().uri("/missing").to_request())
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(test::read_body(res).await.is_empty());
    }

    #[actix_web::test]
    async fn valid_request_reaches_handler() {
        let transport = Arc::new(TransportServer::default());
        let app = app!(transport);
        let key = AccountKey::generate(&KeySpec::p256()).unwrap();

        let nonce = transport.nonces().issue();
        let payload = json!({"contact": ["mailto:a@b.com"]});
        let body = signed_body(&key, &nonce, "http://example.com/echo", &payload);

        let res = test::call_service(&app, post(body).to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().contains_key(REPLAY_NONCE));

        let body = test::read_body_json::<Value, _>(res).await;
        assert_eq!(body["payload"], payload);
        assert_eq!(body["thumbprint"], key.thumbprint());
    }

    #[actix_web::test]
    async fn replayed_nonce_is_rejected() {
        let transport = Arc::new(TransportServer::default());
        let app = app!(transport);
        let key = AccountKey::generate(&KeySpec::p256()).unwrap();

        let nonce = transport.nonces().issue();
        let body = signed_body(&key, &nonce, "http://example.com/echo", &json!({}));

        let res = test::call_service(&app, post(body.clone()).to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = test::call_service(&app, post(body).to_request()).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(res.headers().contains_key(REPLAY_NONCE));

        let problem = test::read_body_json::<Value, _>(res).await;
        assert_eq!(problem["type"], "urn:ietf:params:acme:error:badNonce");
    }

    #[actix_web::test]
    async fn url_must_match_request() {
        let transport = Arc::new(TransportServer::default());
        let app = app!(transport);
        let key = AccountKey::generate(&KeySpec::p256()).unwrap();

        for url in [
            "https://example.com/echo",
            "http://example.org/echo",
            "http://example.com:8080/echo",
            "http://example.com/other",
            "http://example.com/echo?x=1",
        ] {
            let nonce = transport.nonces().issue();
            let body = signed_body(&key, &nonce, url, &json!({}));

            let res = test::call_service(&app, post(body).to_request()).await;
            assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{url}");

            let problem = test::read_body_json::<Value, _>(res).await;
            assert_eq!(problem["type"], "urn:ietf:params:acme:error:malformed");
        }

        // explicit default port is the same target
        let nonce = transport.nonces().issue();
        let body = signed_body(&key, &nonce, "http://example.com:80/echo", &json!({}));
        let res = test::call_service(&app, post(body).to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn forged_and_garbage_bodies_are_malformed() {
        let transport = Arc::new(TransportServer::default());
        let app = app!(transport);
        let key = AccountKey::generate(&KeySpec::p256()).unwrap();

        let nonce = transport.nonces().issue();
        let mut jws = jws::sign(&key, &nonce, "http://example.com/echo", &json!({"a": 1})).unwrap();
        jws.payload = crate::util::base64url(br#"{"a":2}"#);

        for body in [serde_json::to_string(&jws).unwrap(), "not json".to_owned()] {
            let res = test::call_service(&app, post(body).to_request()).await;
            assert_eq!(res.status(), StatusCode::BAD_REQUEST);

            let problem = test::read_body_json::<Value, _>(res).await;
            assert_eq!(problem["type"], "urn:ietf:params:acme:error:malformed");
        }

        // the forged request never consumed its nonce
        assert!(transport.nonces().consume(&nonce));
    }
}
