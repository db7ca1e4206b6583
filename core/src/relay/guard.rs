// Token guard: authenticates relay connections at the WebSocket handshake

use crate::auth::{AuthError, TokenVerifier};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

#[derive(Clone)]
pub struct TokenGuard {
    verifier: Arc<dyn TokenVerifier>,
}

impl TokenGuard {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Identity bound to the handshake request, or why it was refused
    pub fn authorize(&self, request: &Request) -> Result<String, AuthError> {
        let authorization = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        self.authorize_parts(request.uri().query(), authorization)
    }

    pub fn authorize_parts(
        &self,
        query: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<String, AuthError> {
        let token = extract_token(query, authorization).ok_or(AuthError::MissingToken)?;
        self.verifier.verify_token(&token)
    }
}

/// The `token` query parameter, falling back to an `Authorization: Bearer` header
pub fn extract_token(query: Option<&str>, authorization: Option<&str>) -> Option<String> {
    let from_query = query.and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
    });

    from_query
        .or_else(|| {
            authorization
                .and_then(|header| header.strip_prefix("Bearer "))
                .map(|token| token.trim().to_string())
        })
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenIssuer;
    use tokio_tungstenite::tungstenite::http;

    fn guard() -> (TokenGuard, TokenIssuer) {
        let issuer = TokenIssuer::new(b"token-secret").unwrap();
        (TokenGuard::new(Arc::new(issuer.clone())), issuer)
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(extract_token(Some("token=abc"), None), Some("abc".to_string()));
        assert_eq!(
            extract_token(Some("x=1&token=abc&y=2"), None),
            Some("abc".to_string())
        );
        assert_eq!(extract_token(None, Some("Bearer xyz")), Some("xyz".to_string()));
        assert_eq!(
            extract_token(Some("token=abc"), Some("Bearer xyz")),
            Some("abc".to_string())
        );
        assert_eq!(extract_token(Some("token="), None), None);
        assert_eq!(extract_token(Some("other=1"), Some("Basic zzz")), None);
        assert_eq!(extract_token(None, None), None);
    }

    #[test]
    fn test_authorize_request() {
        let (guard, issuer) = guard();
        let token = issuer.issue("alice");

        let request = http::Request::builder()
            .uri(format!("/?token={token}"))
            .body(())
            .unwrap();
        assert_eq!(guard.authorize(&request).unwrap(), "alice");

        let request = http::Request::builder()
            .uri("/")
            .header("Authorization", format!("Bearer {token}"))
            .body(())
            .unwrap();
        assert_eq!(guard.authorize(&request).unwrap(), "alice");
    }

    #[test]
    fn test_rejections() {
        let (guard, issuer) = guard();

        assert_eq!(guard.authorize_parts(None, None), Err(AuthError::MissingToken));
        assert_eq!(
            guard.authorize_parts(Some("token=not-a-token"), None),
            Err(AuthError::MalformedToken)
        );

        let expired = issuer.issue_at("alice", 1_000);
        assert_eq!(
            guard.authorize_parts(Some(&format!("token={expired}")), None),
            Err(AuthError::Expired)
        );

        let forged = TokenIssuer::new(b"other").unwrap().issue("alice");
        assert_eq!(
            guard.authorize_parts(Some(&format!("token={forged}")), None),
            Err(AuthError::BadSignature)
        );
    }
}
