//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for working with
//! secrets in the snappea context.

pub use secrecy::{ExposeSecret, SecretString};

/// Render a connection URL with its password masked, for logs.
pub fn redact_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "<redacted>".to_string();
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => format!("{scheme}://{rest}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_masked() {
        let url = SecretString::from("postgres://snappea:hunter2@db:5432/queue".to_string());
        assert_eq!(redact_url(&url), "postgres://snappea:***@db:5432/queue");
    }

    #[test]
    fn non_url_is_fully_hidden() {
        let url = SecretString::from("hunter2".to_string());
        assert_eq!(redact_url(&url), "<redacted>");
    }
}
