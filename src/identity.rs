//! Validated caller identity attached by an upstream auth collaborator.
//!
//! The gateway never validates credentials itself: it consumes an identity
//! that an upstream layer has already verified and propagates it to
//! backends via `X-User-*` headers.

use http::header::{HeaderMap, HeaderValue};

const USER_ID: &str = "x-user-id";
const COMPANY_ID: &str = "x-company-id";
const ROLE: &str = "x-user-role";
const EMAIL: &str = "x-user-email";

/// A validated caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub user_id: String,
    pub company_id: Option<String>,
    pub role: Option<String>,
    pub email: Option<String>,
}

impl RequestIdentity {
    /// Reads an identity the auth layer attached to the request.
    ///
    /// Returns `None` unless a user id is present; the remaining fields
    /// are optional.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let user_id = header_str(headers, USER_ID)?;
        Some(Self {
            user_id,
            company_id: header_str(headers, COMPANY_ID),
            role: header_str(headers, ROLE),
            email: header_str(headers, EMAIL),
        })
    }

    /// Injects identity-propagation headers into an outbound request.
    pub fn apply(&self, headers: &mut HeaderMap) {
        set_header(headers, USER_ID, &self.user_id);
        if let Some(company_id) = &self.company_id {
            set_header(headers, COMPANY_ID, company_id);
        }
        if let Some(role) = &self.role {
            set_header(headers, ROLE, role);
        }
        if let Some(email) = &self.email {
            set_header(headers, EMAIL, email);
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
