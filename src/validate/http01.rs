use std::{
    io,
    net::{Ipv4Addr, SocketAddr, TcpListener},
};

use actix_web::{dev::ServerHandle, web, App, HttpRequest, HttpResponse, HttpServer};

use super::{Answer, ValidatorError};
use crate::api::ChallengeResponse;

/// Serves the key authorization at `/.well-known/acme-challenge/{token}`.
#[derive(Debug)]
pub struct Http01Validator {
    domain: String,
    answer: Answer,
    port: u16,
    handle: Option<ServerHandle>,
}

#[derive(Debug, Clone)]
struct Expected {
    domain: String,
    answer: Answer,
}

impl Http01Validator {
    pub fn new(
        domain: &str,
        response: &ChallengeResponse,
        port: u16,
    ) -> Result<Self, ValidatorError> {
        Ok(Http01Validator {
            domain: domain.to_ascii_lowercase(),
            answer: Answer::from_response("http-01", response)?,
            port,
            handle: None,
        })
    }

    pub async fn start(&mut self) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port))?;
        let addr = listener.local_addr()?;

        let expected = Expected {
            domain: self.domain.clone(),
            answer: self.answer.clone(),
        };

        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(expected.clone()))
                .route("/.well-known/acme-challenge/{token}", web::get().to(serve))
        })
        .workers(1)
        .disable_signals()
        .listen(listener)?
        .run();

        self.handle = Some(server.handle());
        tokio::spawn(server);

        log::debug!("http-01 validator for {} listening on {addr}", self.domain);
        Ok(addr)
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop(false).await;
        }
    }
}

async fn serve(
    req: HttpRequest,
    token: web::Path<String>,
    expected: web::Data<Expected>,
) -> HttpResponse {
    let host = req.connection_info().host().to_owned();
    let hostname = host.split(':').next().unwrap_or_default();

    if !hostname.eq_ignore_ascii_case(&expected.domain) || *token != expected.answer.token {
        log::debug!("http-01 miss: host {host}, token {token}");
        return HttpResponse::NotFound().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain")
        .body(expected.answer.key_authorization.clone())
}
