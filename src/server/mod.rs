//! The ACME server.
//!
//! [`AcmeServer::service`] mounts every route under the configured base path, behind a
//! [`TransportServer`] that authenticates POST bodies and stamps nonces on responses.

use std::sync::Arc;

use actix_web::{dev::HttpServiceFactory, http::header, web, HttpResponse};
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};

use crate::{
    api::{self, ApplicationStatus, AuthorizationStatus, ChallengeStatus, RegistrationStatus},
    cert::{check_csr, CsrPolicy},
    nonce::NonceSource,
};

mod ca;
mod challenge;
mod config;
pub mod db;
mod error;
mod transport;

pub use self::{
    ca::{CertificateAuthority, StubAuthority},
    challenge::{
        Auto, Challenge, ChallengeState, ChallengeType, Dns01, Http01, TlsSni01,
        ValidationContext,
    },
    config::{Policy, ServerConfig},
    error::ServerError,
    transport::{Signed, TransportServer, REPLAY_NONCE},
};
use self::db::{AppUpdate, ApplicationRecord, AuthorizationRecord, Db, RegistrationRecord};

pub struct AcmeServer {
    config: ServerConfig,
    base_url: String,
    csr_policy: CsrPolicy,
    transport: Arc<TransportServer>,
    db: Db,
    ca: Box<dyn CertificateAuthority>,
}

impl AcmeServer {
    /// A server issuing through [`StubAuthority`].
    pub fn new(config: ServerConfig) -> Self {
        let ca = StubAuthority::new(config.base_url());
        Self::with_authority(config, ca)
    }

    pub fn with_authority(config: ServerConfig, ca: impl CertificateAuthority + 'static) -> Self {
        AcmeServer {
            base_url: config.base_url(),
            csr_policy: CsrPolicy {
                allowed_extensions: config.policy.allowed_extensions.clone(),
            },
            transport: Arc::new(TransportServer::new(NonceSource::new())),
            db: Db::new(),
            ca: Box::new(ca),
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Prefix of every resource URL, with trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn directory_url(&self) -> String {
        self.url("directory")
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn transport(&self) -> &TransportServer {
        &self.transport
    }

    /// All routes, for use with `App::service`.
    pub fn service(self: &Arc<Self>) -> impl HttpServiceFactory {
        let base_path = self.config.base_path.trim_end_matches('/').to_owned();

        self.transport
            .scope(&base_path)
            .app_data(web::Data::from(Arc::clone(self)))
            .route("/directory", web::get().to(directory))
            .route("/new-reg", web::post().to(new_registration))
            .route("/reg/{id}", web::post().to(update_registration))
            .route("/new-app", web::post().to(new_application))
            .route("/authz/{id}/{index}", web::get().to(get_challenge))
            .route("/authz/{id}/{index}", web::post().to(respond_to_challenge))
            .route("/{type}/{id}", web::get().to(get_resource))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn directory(&self) -> api::Directory {
        api::Directory {
            directory: self.url("directory"),
            new_reg: self.url("new-reg"),
            new_app: self.url("new-app"),
            new_authz: None,
            new_cert: None,
            meta: Some(api::DirectoryMeta {
                terms_of_service: self.config.terms_of_service.clone(),
            }),
        }
    }

    /// `Link` header pointing at the terms of service, if configured.
    fn terms_link(&self) -> Option<String> {
        let terms = self.config.terms_of_service.as_deref()?;
        Some(format!(r#"<{terms}>;rel="terms-of-service""#))
    }

    fn check_agreement(&self, agreement: Option<&str>) -> Result<(), ServerError> {
        match agreement {
            None => Ok(()),
            Some(agreement) if self.config.terms_of_service.as_deref() == Some(agreement) => {
                Ok(())
            }
            Some(agreement) => Err(ServerError::malformed_because(
                "Incorrect agreement URL",
                format!("{agreement} is not the current terms of service"),
            )),
        }
    }

    fn registered(&self, thumbprint: &str) -> Result<RegistrationRecord, ServerError> {
        self.db
            .registration(thumbprint)
            .ok_or_else(|| ServerError::unauthorized("Unknown account key"))
    }

    fn new_authorization(
        &self,
        thumbprint: &str,
        name: &str,
        scope: Option<String>,
        now: OffsetDateTime,
    ) -> AuthorizationRecord {
        let id = uuid::Uuid::new_v4().to_string();

        let record = AuthorizationRecord {
            url: self.url(&format!("authz/{id}")),
            id,
            thumbprint: thumbprint.to_owned(),
            identifier: name.to_owned(),
            status: AuthorizationStatus::Pending,
            expires: now + Duration::seconds(self.config.policy.authz_expiry_seconds),
            scope,
            challenges: self
                .config
                .challenge_types
                .iter()
                .map(|challenge_type| challenge_type.instantiate())
                .collect(),
        };

        log::debug!("Created authorization {} for {name}", record.id);
        self.db.put_authorization(record.clone());
        record
    }

    /// Loads an authorization with its status recomputed, propagating any change to
    /// applications.
    async fn refreshed_authorization(&self, id: &str) -> Result<AuthorizationRecord, ServerError> {
        let now = OffsetDateTime::now_utc();

        let (record, changed) = self
            .db
            .with_authorization_mut(id, |authz| {
                let changed = authz.refresh(now);
                (authz.clone(), changed)
            })
            .ok_or(ServerError::NotFound)?;

        if changed {
            self.update_apps_for(&record).await;
        }

        Ok(record)
    }

    /// Propagates the status of `authz` to the applications requiring it and issues every
    /// application that became ready.
    pub async fn update_apps_for(&self, authz: &AuthorizationRecord) -> Vec<AppUpdate> {
        let mut updates = self.db.update_apps_for(authz);

        for update in updates.iter_mut().filter(|update| update.ready) {
            if let Some(status) = self.issue(&update.id).await {
                update.status = status;
            }
        }

        updates
    }

    async fn issue(&self, id: &str) -> Option<ApplicationStatus> {
        let application = self.db.application(id)?;
        let outcome = self.ca.issue(&application).await;

        self.db.with_application_mut(id, |app| {
            match outcome {
                Ok(certificate) => {
                    log::info!("Application {id} issued at {certificate}");
                    app.certificate = Some(certificate);
                    app.status = ApplicationStatus::Valid;
                }
                Err(err) => {
                    log::error!("Issuance for application {id} failed: {err}");
                    app.status = ApplicationStatus::Invalid;
                }
            }

            app.status
        })
    }
}

fn parse_date(value: Option<&str>, field: &str) -> Result<Option<OffsetDateTime>, ServerError> {
    value
        .map(|value| {
            OffsetDateTime::parse(value, &Rfc3339).map_err(|err| {
                ServerError::malformed_because(&format!("Invalid {field} format"), err)
            })
        })
        .transpose()
}

fn check_contacts(contact: &[String]) -> Result<(), ServerError> {
    for uri in contact {
        url::Url::parse(uri)
            .map_err(|err| ServerError::malformed_because("Invalid contact URI", format!("{uri}: {err}")))?;
    }

    Ok(())
}

async fn directory(server: web::Data<AcmeServer>) -> HttpResponse {
    HttpResponse::Ok().json(server.directory())
}

async fn get_resource(
    server: web::Data<AcmeServer>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ServerError> {
    let (resource_type, id) = path.into_inner();

    match resource_type.as_str() {
        "reg" => Err(ServerError::unauthorized(
            "Registrations are only available to their owner",
        )),

        "authz" => {
            let record = server.refreshed_authorization(&id).await?;
            Ok(HttpResponse::Ok().json(record.view()))
        }

        "app" => {
            let record = server.db.application(&id).ok_or(ServerError::NotFound)?;
            Ok(HttpResponse::Ok().json(record.view()))
        }

        _ => Err(ServerError::NotFound),
    }
}

async fn new_registration(
    server: web::Data<AcmeServer>,
    signed: Signed<api::NewRegistration>,
) -> Result<HttpResponse, ServerError> {
    let Signed {
        payload,
        jwk,
        thumbprint,
        ..
    } = signed;

    server.check_agreement(payload.agreement.as_deref())?;

    let contact = payload.contact.unwrap_or_default();
    check_contacts(&contact)?;

    let record = RegistrationRecord {
        url: server.url(&format!("reg/{thumbprint}")),
        id: thumbprint,
        key: jwk,
        status: RegistrationStatus::Good,
        contact,
        agreement: payload.agreement,
    };

    let record = server.db.create_registration(record).map_err(|existing| {
        log::debug!("Key {} is already registered", existing.id);
        ServerError::Conflict {
            location: existing.url,
        }
    })?;

    log::info!("New registration {}", record.id);

    let mut res = HttpResponse::Created();
    res.insert_header((header::LOCATION, record.url.as_str()));

    if let Some(link) = server.terms_link() {
        res.insert_header((header::LINK, link));
    }

    Ok(res.json(record.view()))
}

async fn update_registration(
    server: web::Data<AcmeServer>,
    path: web::Path<String>,
    signed: Signed<api::UpdateRegistration>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    let registration = server.registered(&signed.thumbprint)?;

    if registration.id != id {
        return Err(ServerError::unauthorized("Unauthorized account key"));
    }

    let payload = signed.payload;
    server.check_agreement(payload.agreement.as_deref())?;

    if let Some(contact) = &payload.contact {
        check_contacts(contact)?;
    }

    let record = server
        .db
        .with_registration_mut(&id, |reg| {
            if let Some(contact) = payload.contact {
                reg.contact = contact;
            }

            if let Some(agreement) = payload.agreement {
                reg.agreement = Some(agreement);
            }

            reg.clone()
        })
        .ok_or_else(|| ServerError::unauthorized("Unknown account key"))?;

    let mut res = HttpResponse::Ok();

    if let Some(link) = server.terms_link() {
        res.insert_header((header::LINK, link));
    }

    Ok(res.json(record.view()))
}

async fn new_application(
    server: web::Data<AcmeServer>,
    signed: Signed<api::NewApplication>,
) -> Result<HttpResponse, ServerError> {
    let registration = server.registered(&signed.thumbprint)?;
    let payload = signed.payload;
    let now = OffsetDateTime::now_utc();

    let csr = payload
        .csr
        .ok_or_else(|| ServerError::malformed("CSR must be provided"))?;
    let names = check_csr(&csr, &server.csr_policy)?;

    let not_before = parse_date(payload.not_before.as_deref(), "notBefore")?;
    let not_after = parse_date(payload.not_after.as_deref(), "notAfter")?;

    if let Some(not_after) = not_after {
        let start = not_before.unwrap_or(now);

        if not_after <= start {
            return Err(ServerError::malformed_because(
                "Invalid new application",
                "notAfter must be after notBefore",
            ));
        }

        let max = Duration::seconds(server.config.policy.max_validity_seconds);
        if not_after - start > max {
            return Err(ServerError::malformed_because(
                "Invalid new application",
                format!("validity exceeds {} seconds", max.whole_seconds()),
            ));
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    let url = server.url(&format!("app/{id}"));
    let scope = server
        .config
        .policy
        .scoped_authorizations
        .then(|| url.clone());

    let requirements = names
        .iter()
        .map(|name| {
            let authz = server
                .db
                .authz_for(&registration.id, name, scope.as_deref(), now)
                .unwrap_or_else(|| {
                    server.new_authorization(&registration.id, name, scope.clone(), now)
                });

            api::Requirement::authorization(authz.url, authz.status)
        })
        .collect::<Vec<_>>();

    let mut record = ApplicationRecord {
        id: id.clone(),
        url,
        thumbprint: registration.id,
        status: ApplicationStatus::Pending,
        csr,
        names,
        not_before: payload.not_before,
        not_after: payload.not_after,
        requirements,
        certificate: None,
    };

    let ready = record.all_requirements_valid();
    if ready {
        record.status = ApplicationStatus::Processing;
    }

    log::info!("New application {id} for {}", record.names.join(", "));
    server.db.put_application(record);

    if ready {
        server.issue(&id).await;
    }

    let record = server
        .db
        .application(&id)
        .ok_or_else(|| ServerError::Internal(format!("application {id} vanished")))?;

    Ok(HttpResponse::Created()
        .insert_header((header::LOCATION, record.url.as_str()))
        .json(record.view()))
}

fn challenge_index(raw: &str) -> Result<usize, ServerError> {
    raw.parse().map_err(|_| ServerError::NotFound)
}

async fn get_challenge(
    server: web::Data<AcmeServer>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ServerError> {
    let (id, index) = path.into_inner();
    let index = challenge_index(&index)?;

    let record = server.refreshed_authorization(&id).await?;
    let challenge = record.challenges.get(index).ok_or(ServerError::NotFound)?;

    Ok(HttpResponse::Ok().json(challenge.to_view(&record.challenge_url(index))))
}

async fn respond_to_challenge(
    server: web::Data<AcmeServer>,
    path: web::Path<(String, String)>,
    signed: Signed<api::ChallengeResponse>,
) -> Result<HttpResponse, ServerError> {
    let (id, index) = path.into_inner();
    let index = challenge_index(&index)?;

    let record = server.db.authorization(&id).ok_or(ServerError::NotFound)?;
    if index >= record.challenges.len() {
        return Err(ServerError::NotFound);
    }

    let registration = server.registered(&signed.thumbprint)?;
    if registration.id != record.thumbprint {
        return Err(ServerError::unauthorized("Unauthorized account key"));
    }

    let now = OffsetDateTime::now_utc();

    // claim the challenge so concurrent responses cannot both run it
    let (claimed, changed, current) = server
        .db
        .with_authorization_mut(&id, |authz| {
            let changed = authz.refresh(now);
            let pending = authz.status == AuthorizationStatus::Pending;

            let claimed = authz.challenges.get_mut(index).and_then(|challenge| {
                if !pending || challenge.state().status != ChallengeStatus::Pending {
                    return None;
                }

                challenge.state_mut().status = ChallengeStatus::Processing;
                Some(challenge.clone())
            });

            (claimed, changed, authz.clone())
        })
        .ok_or(ServerError::NotFound)?;

    if changed {
        server.update_apps_for(&current).await;
    }

    let Some(mut challenge) = claimed else {
        log::debug!("Challenge {index} of {id} is not pending");
        let record = server.refreshed_authorization(&id).await?;
        let challenge = record.challenges.get(index).ok_or(ServerError::NotFound)?;
        return Ok(HttpResponse::Ok().json(challenge.to_view(&record.challenge_url(index))));
    };

    let ctx = ValidationContext {
        identifier: record.identifier.clone(),
        thumbprint: registration.id,
    };

    if let Err(err) = challenge.update(&ctx, &signed.payload).await {
        server.db.with_authorization_mut(&id, |authz| {
            if let Some(challenge) = authz.challenges.get_mut(index) {
                challenge.state_mut().status = ChallengeStatus::Pending;
            }
        });

        return Err(err);
    }

    log::debug!(
        "Challenge {index} of {id} is now {:?}",
        challenge.state().status
    );

    let record = server
        .db
        .with_authorization_mut(&id, |authz| {
            if let Some(slot) = authz.challenges.get_mut(index) {
                *slot = challenge;
            }

            authz.refresh(OffsetDateTime::now_utc());
            authz.clone()
        })
        .ok_or(ServerError::NotFound)?;

    let updates = server.update_apps_for(&record).await;
    log::debug!("Authorization {id} touched {} application(s)", updates.len());

    let challenge = record.challenges.get(index).ok_or(ServerError::NotFound)?;
    Ok(HttpResponse::Ok().json(challenge.to_view(&record.challenge_url(index))))
}
