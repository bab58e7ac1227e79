//! In-memory resource store.
//!
//! One lock per resource type. Locks are only held for the duration of a closure, never across
//! an `.await`.

use std::collections::{hash_map::Entry, HashMap};

use parking_lot::RwLock;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use super::challenge::Challenge;
use crate::{
    api::{self, ApplicationStatus, AuthorizationStatus, ChallengeStatus, RegistrationStatus},
    jws::Jwk,
};

#[derive(Debug, Clone)]
pub struct RegistrationRecord {
    /// Key thumbprint.
    pub id: String,
    pub url: String,
    pub key: Jwk,
    pub status: RegistrationStatus,
    pub contact: Vec<String>,
    pub agreement: Option<String>,
}

impl RegistrationRecord {
    pub fn view(&self) -> api::Registration {
        api::Registration {
            key: self.key.clone(),
            status: self.status,
            contact: self.contact.clone(),
            agreement: self.agreement.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationRecord {
    pub id: String,
    pub url: String,

    /// Thumbprint of the owning account.
    pub thumbprint: String,

    /// Lowercased domain name.
    pub identifier: String,

    pub status: AuthorizationStatus,
    pub expires: OffsetDateTime,

    /// URL of the only application allowed to use this authorization.
    pub scope: Option<String>,

    pub challenges: Vec<Box<dyn Challenge>>,
}

impl AuthorizationRecord {
    pub fn challenge_url(&self, index: usize) -> String {
        format!("{}/{index}", self.url)
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires <= now
    }

    /// Recomputes the status from expiry and challenge states. Returns true if it changed.
    ///
    /// Expired authorizations and ones whose challenges have all failed become invalid. Terminal
    /// and deactivated authorizations are left alone.
    pub fn refresh(&mut self, now: OffsetDateTime) -> bool {
        if self.status != AuthorizationStatus::Pending {
            return false;
        }

        let any_valid = self
            .challenges
            .iter()
            .any(|challenge| challenge.state().status == ChallengeStatus::Valid);

        let all_failed = !self.challenges.is_empty()
            && self
                .challenges
                .iter()
                .all(|challenge| challenge.state().status == ChallengeStatus::Invalid);

        self.status = if self.is_expired(now) || all_failed {
            AuthorizationStatus::Invalid
        } else if any_valid {
            AuthorizationStatus::Valid
        } else {
            return false;
        };

        log::debug!("Authorization {} is now {:?}", self.id, self.status);
        true
    }

    pub fn view(&self) -> api::Authorization {
        api::Authorization {
            identifier: api::Identifier::dns(&self.identifier),
            status: self.status,
            expires: self.expires.format(&Rfc3339).ok(),
            scope: self.scope.clone(),
            challenges: self
                .challenges
                .iter()
                .enumerate()
                .map(|(index, challenge)| challenge.to_view(&self.challenge_url(index)))
                .collect(),
            combinations: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationRecord {
    pub id: String,
    pub url: String,

    /// Thumbprint of the owning account.
    pub thumbprint: String,

    pub status: ApplicationStatus,
    pub csr: String,

    /// Names extracted from the CSR.
    pub names: Vec<String>,

    pub not_before: Option<String>,
    pub not_after: Option<String>,
    pub requirements: Vec<api::Requirement>,
    pub certificate: Option<String>,
}

impl ApplicationRecord {
    pub fn view(&self) -> api::Application {
        api::Application {
            status: self.status,
            expires: None,
            csr: self.csr.clone(),
            not_before: self.not_before.clone(),
            not_after: self.not_after.clone(),
            requirements: self.requirements.clone(),
            certificate: self.certificate.clone(),
        }
    }

    pub fn all_requirements_valid(&self) -> bool {
        self.requirements
            .iter()
            .all(|req| req.status == AuthorizationStatus::Valid)
    }

    fn any_requirement_failed(&self) -> bool {
        self.requirements.iter().any(|req| {
            matches!(
                req.status,
                AuthorizationStatus::Invalid | AuthorizationStatus::Deactivated
            )
        })
    }
}

/// What happened to one application after one of its authorizations changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppUpdate {
    pub id: String,
    pub status: ApplicationStatus,

    /// All requirements just became valid; the application is waiting for its certificate.
    pub ready: bool,
}

#[derive(Debug, Default)]
pub struct Db {
    registrations: RwLock<HashMap<String, RegistrationRecord>>,
    authorizations: RwLock<HashMap<String, AuthorizationRecord>>,
    applications: RwLock<HashMap<String, ApplicationRecord>>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `record` unless its key is already registered, in which case the existing record
    /// is returned.
    pub fn create_registration(
        &self,
        record: RegistrationRecord,
    ) -> Result<RegistrationRecord, RegistrationRecord> {
        match self.registrations.write().entry(record.id.clone()) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => Ok(slot.insert(record).clone()),
        }
    }

    pub fn registration(&self, id: &str) -> Option<RegistrationRecord> {
        self.registrations.read().get(id).cloned()
    }

    pub fn with_registration_mut<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut RegistrationRecord) -> R,
    ) -> Option<R> {
        self.registrations.write().get_mut(id).map(f)
    }

    pub fn put_authorization(&self, record: AuthorizationRecord) {
        self.authorizations.write().insert(record.id.clone(), record);
    }

    pub fn authorization(&self, id: &str) -> Option<AuthorizationRecord> {
        self.authorizations.read().get(id).cloned()
    }

    pub fn with_authorization_mut<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut AuthorizationRecord) -> R,
    ) -> Option<R> {
        self.authorizations.write().get_mut(id).map(f)
    }

    /// Finds a reusable authorization of `thumbprint` for `name`.
    ///
    /// Invalid, deactivated and expired authorizations are skipped, as are ones whose scope
    /// differs from `scope`.
    pub fn authz_for(
        &self,
        thumbprint: &str,
        name: &str,
        scope: Option<&str>,
        now: OffsetDateTime,
    ) -> Option<AuthorizationRecord> {
        self.authorizations
            .read()
            .values()
            .filter(|authz| authz.thumbprint == thumbprint && authz.identifier == name)
            .filter(|authz| authz.scope.as_deref() == scope)
            .filter(|authz| {
                matches!(
                    authz.status,
                    AuthorizationStatus::Pending | AuthorizationStatus::Valid
                )
            })
            .find(|authz| !authz.is_expired(now))
            .cloned()
    }

    pub fn put_application(&self, record: ApplicationRecord) {
        self.applications.write().insert(record.id.clone(), record);
    }

    pub fn application(&self, id: &str) -> Option<ApplicationRecord> {
        self.applications.read().get(id).cloned()
    }

    pub fn with_application_mut<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ApplicationRecord) -> R,
    ) -> Option<R> {
        self.applications.write().get_mut(id).map(f)
    }

    /// Pushes the status of `authz` into every pending application of the same account that
    /// requires it.
    ///
    /// Each application is updated in its own critical section. An application becomes
    /// `invalid` as soon as a requirement fails and `processing` once all requirements are
    /// valid; the latter is reported as [`AppUpdate::ready`].
    pub fn update_apps_for(&self, authz: &AuthorizationRecord) -> Vec<AppUpdate> {
        let dependents = self
            .applications
            .read()
            .values()
            .filter(|app| app.thumbprint == authz.thumbprint)
            .filter(|app| app.requirements.iter().any(|req| req.url == authz.url))
            .map(|app| app.id.clone())
            .collect::<Vec<_>>();

        dependents
            .into_iter()
            .filter_map(|id| {
                self.with_application_mut(&id, |app| {
                    for req in app.requirements.iter_mut().filter(|req| req.url == authz.url) {
                        req.status = authz.status;
                    }

                    let mut ready = false;

                    if app.status == ApplicationStatus::Pending {
                        if app.any_requirement_failed() {
                            log::info!("Application {} failed a requirement", app.id);
                            app.status = ApplicationStatus::Invalid;
                        } else if app.all_requirements_valid() {
                            app.status = ApplicationStatus::Processing;
                            ready = true;
                        }
                    }

                    AppUpdate {
                        id: app.id.clone(),
                        status: app.status,
                        ready,
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::server::ChallengeType;

    const THUMB: &str = "thumb";

    fn authz(id: &str, name: &str, expires: OffsetDateTime) -> AuthorizationRecord {
        AuthorizationRecord {
            id: id.to_owned(),
            url: format!("http://localhost/authz/{id}"),
            thumbprint: THUMB.to_owned(),
            identifier: name.to_owned(),
            status: AuthorizationStatus::Pending,
            expires,
            scope: None,
            challenges: vec![ChallengeType::Auto.instantiate()],
        }
    }

    fn app(id: &str, requirements: &[&AuthorizationRecord]) -> ApplicationRecord {
        ApplicationRecord {
            id: id.to_owned(),
            url: format!("http://localhost/app/{id}"),
            thumbprint: THUMB.to_owned(),
            status: ApplicationStatus::Pending,
            csr: String::new(),
            names: Vec::new(),
            not_before: None,
            not_after: None,
            requirements: requirements
                .iter()
                .map(|authz| api::Requirement::authorization(authz.url.clone(), authz.status))
                .collect(),
            certificate: None,
        }
    }

    fn later() -> OffsetDateTime {
        OffsetDateTime::now_utc() + Duration::days(1)
    }

    #[test]
    fn duplicate_registration_returns_existing() {
        let db = Db::new();
        let key = crate::key::AccountKey::generate(&crate::key::KeySpec::p256())
            .unwrap()
            .jwk();

        let record = RegistrationRecord {
            id: THUMB.to_owned(),
            url: "http://localhost/reg/thumb".to_owned(),
            key,
            status: RegistrationStatus::Good,
            contact: vec!["mailto:a@b.com".to_owned()],
            agreement: None,
        };

        db.create_registration(record.clone()).unwrap();

        let mut second = record.clone();
        second.contact.clear();
        let existing = db.create_registration(second).unwrap_err();
        assert_eq!(existing.contact, record.contact);
        assert_eq!(existing.url, record.url);
    }

    #[test]
    fn refresh_follows_challenges_and_expiry() {
        let now = OffsetDateTime::now_utc();

        let mut pending = authz("a", "example.com", later());
        assert!(!pending.refresh(now));
        assert_eq!(pending.status, AuthorizationStatus::Pending);

        pending.challenges[0].state_mut().status = ChallengeStatus::Valid;
        assert!(pending.refresh(now));
        assert_eq!(pending.status, AuthorizationStatus::Valid);

        let mut expired = authz("b", "example.com", now - Duration::seconds(1));
        expired.challenges[0].state_mut().status = ChallengeStatus::Valid;
        assert!(expired.refresh(now));
        assert_eq!(expired.status, AuthorizationStatus::Invalid);

        let mut failed = authz("c", "example.com", later());
        failed.challenges.push(ChallengeType::Http01.instantiate());
        failed.challenges[0].state_mut().status = ChallengeStatus::Invalid;
        assert!(!failed.refresh(now));
        failed.challenges[1].state_mut().status = ChallengeStatus::Invalid;
        assert!(failed.refresh(now));
        assert_eq!(failed.status, AuthorizationStatus::Invalid);

        // terminal
        expired.challenges[0].state_mut().status = ChallengeStatus::Pending;
        assert!(!expired.refresh(now + Duration::days(2)));
        assert_eq!(expired.status, AuthorizationStatus::Invalid);
    }

    #[test]
    fn authz_for_skips_unusable_authorizations() {
        let db = Db::new();
        let now = OffsetDateTime::now_utc();

        let mut invalid = authz("invalid", "example.com", later());
        invalid.status = AuthorizationStatus::Invalid;
        db.put_authorization(invalid);
        db.put_authorization(authz("expired", "example.com", now - Duration::seconds(1)));

        let mut scoped = authz("scoped", "example.com", later());
        scoped.scope = Some("http://localhost/app/1".to_owned());
        db.put_authorization(scoped);

        assert!(db.authz_for(THUMB, "example.com", None, now).is_none());
        assert_eq!(
            db.authz_for(THUMB, "example.com", Some("http://localhost/app/1"), now)
                .unwrap()
                .id,
            "scoped"
        );
        assert!(db
            .authz_for(THUMB, "example.com", Some("http://localhost/app/2"), now)
            .is_none());

        db.put_authorization(authz("usable", "example.com", later()));
        assert_eq!(db.authz_for(THUMB, "example.com", None, now).unwrap().id, "usable");
        assert!(db.authz_for("other", "example.com", None, now).is_none());
        assert!(db.authz_for(THUMB, "example.org", None, now).is_none());
    }

    #[test]
    fn application_becomes_ready_when_all_requirements_valid() {
        let db = Db::new();

        let mut first = authz("first", "a.example.com", later());
        let mut second = authz("second", "b.example.com", later());
        db.put_application(app("app", &[&first, &second]));

        first.status = AuthorizationStatus::Valid;
        let updates = db.update_apps_for(&first);
        assert_eq!(
            updates,
            [AppUpdate {
                id: "app".to_owned(),
                status: ApplicationStatus::Pending,
                ready: false,
            }]
        );

        second.status = AuthorizationStatus::Valid;
        let updates = db.update_apps_for(&second);
        assert!(updates[0].ready);
        assert_eq!(updates[0].status, ApplicationStatus::Processing);

        // reported ready once
        let updates = db.update_apps_for(&second);
        assert!(!updates[0].ready);

        let app = db.application("app").unwrap();
        assert!(app.all_requirements_valid());
    }

    #[test]
    fn failed_requirement_invalidates_application() {
        let db = Db::new();

        let mut failed = authz("failed", "example.com", later());
        let other = authz("other", "example.com", later());
        db.put_application(app("app", &[&failed]));
        db.put_application(app("unrelated", &[&other]));

        failed.status = AuthorizationStatus::Invalid;
        let updates = db.update_apps_for(&failed);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, ApplicationStatus::Invalid);
        assert!(!updates[0].ready);

        assert_eq!(
            db.application("unrelated").unwrap().status,
            ApplicationStatus::Pending
        );
    }
}
