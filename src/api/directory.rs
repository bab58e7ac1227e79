use serde::{Deserialize, Serialize};

/// Directory object for client self-configuration.
///
/// # Example JSON
///
/// ```json
/// {
///   "directory": "http://localhost:4000/directory",
///   "new-reg": "http://localhost:4000/new-reg",
///   "new-app": "http://localhost:4000/new-app",
///   "meta": {
///     "terms-of-service": "https://example.com/acme/terms"
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Directory {
    /// URL of this directory.
    pub directory: String,

    /// URL for new registration requests.
    pub new_reg: String,

    /// URL for new application requests.
    pub new_app: String,

    /// URL for pre-authorization requests.
    ///
    /// Not every server offers pre-authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_authz: Option<String>,

    /// URL for direct certificate requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_cert: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DirectoryMeta {
    /// URL identifying the current terms of service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
}

impl Directory {
    /// Returns the terms of service URL, if the server publishes one.
    pub fn terms_of_service(&self) -> Option<&str> {
        self.meta.as_ref()?.terms_of_service.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kebab_case_keys() {
        let dir = serde_json::from_str::<Directory>(
            r#"{
                "directory": "http://127.0.0.1/directory",
                "new-reg": "http://127.0.0.1/new-reg",
                "new-app": "http://127.0.0.1/new-app",
                "meta": { "terms-of-service": "http://127.0.0.1/terms" }
            }"#,
        )
        .unwrap();

        assert_eq!(dir.new_reg, "http://127.0.0.1/new-reg");
        assert_eq!(dir.new_authz, None);
        assert_eq!(dir.terms_of_service(), Some("http://127.0.0.1/terms"));
    }
}
