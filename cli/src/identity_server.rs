// Identity service HTTP front-end: accounts, tokens, public keys

use std::net::SocketAddr;
use std::sync::Arc;
use tandem_core::auth::api::{ErrorResponse, PublicKeyBody, StatusResponse, TokenRequest, TokenResponse};
use tandem_core::identity::parse_public_key_hex;
use tandem_core::relay::guard::extract_token;
use tandem_core::{AuthError, Credentials, UserDirectory};
use warp::http::StatusCode;
use warp::reply::{Reply, Response};
use warp::Filter;

// ============================================================================
// ROUTES
// ============================================================================

pub fn routes(
    users: Arc<UserDirectory>,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    let users_filter = warp::any().map(move || users.clone());

    let register = warp::path!("register")
        .and(warp::post())
        .and(warp::body::json())
        .and(users_filter.clone())
        .and_then(handle_register);

    let login = warp::path!("login")
        .and(warp::post())
        .and(warp::body::json())
        .and(users_filter.clone())
        .and_then(handle_login);

    let refresh = warp::path!("refresh")
        .and(warp::post())
        .and(warp::body::json())
        .and(users_filter.clone())
        .and_then(handle_refresh);

    let get_key = warp::path!("users" / String / "pubkey")
        .and(warp::get())
        .and(users_filter.clone())
        .and_then(handle_get_public_key);

    let put_key = warp::path!("users" / String / "pubkey")
        .and(warp::put())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::body::json())
        .and(users_filter)
        .and_then(handle_put_public_key);

    register
        .or(login)
        .unify()
        .or(refresh)
        .unify()
        .or(get_key)
        .unify()
        .or(put_key)
        .unify()
}

pub async fn serve(users: Arc<UserDirectory>, addr: SocketAddr) {
    tracing::info!("🪪 Identity service listening on http://{}", addr);
    warp::serve(routes(users)).run(addr).await;
}

// ============================================================================
// HANDLERS
// ============================================================================

fn json_reply<T: serde::Serialize>(body: &T, status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn error_reply(error: &AuthError) -> Response {
    let status = match error {
        AuthError::InvalidUsername(_) => StatusCode::BAD_REQUEST,
        AuthError::UserExists(_) => StatusCode::CONFLICT,
        AuthError::UnknownUser(_) => StatusCode::NOT_FOUND,
        AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
        AuthError::InvalidSecret => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNAUTHORIZED,
    };
    json_reply(&ErrorResponse::new(error), status)
}

async fn handle_register(
    credentials: Credentials,
    users: Arc<UserDirectory>,
) -> Result<Response, warp::Rejection> {
    let result = tokio::task::spawn_blocking(move || users.register(&credentials)).await;
    Ok(match result {
        Ok(Ok(())) => json_reply(&StatusResponse::ok(), StatusCode::CREATED),
        Ok(Err(e)) => error_reply(&e),
        Err(e) => json_reply(&ErrorResponse::new(e), StatusCode::INTERNAL_SERVER_ERROR),
    })
}

async fn handle_login(
    credentials: Credentials,
    users: Arc<UserDirectory>,
) -> Result<Response, warp::Rejection> {
    let result = tokio::task::spawn_blocking(move || users.authenticate(&credentials)).await;
    Ok(match result {
        Ok(Ok(token)) => json_reply(&TokenResponse { token }, StatusCode::OK),
        Ok(Err(e)) => error_reply(&e),
        Err(e) => json_reply(&ErrorResponse::new(e), StatusCode::INTERNAL_SERVER_ERROR),
    })
}

async fn handle_refresh(
    request: TokenRequest,
    users: Arc<UserDirectory>,
) -> Result<Response, warp::Rejection> {
    Ok(match users.refresh(&request.token) {
        Ok(token) => json_reply(&TokenResponse { token }, StatusCode::OK),
        Err(e) => error_reply(&e),
    })
}

async fn handle_get_public_key(
    username: String,
    users: Arc<UserDirectory>,
) -> Result<Response, warp::Rejection> {
    Ok(match users.public_key_of(&username) {
        Some(key) => json_reply(
            &PublicKeyBody {
                pubkey: hex::encode(key.as_bytes()),
            },
            StatusCode::OK,
        ),
        None => json_reply(
            &ErrorResponse::new(format!("No public key for {}", username)),
            StatusCode::NOT_FOUND,
        ),
    })
}

async fn handle_put_public_key(
    username: String,
    authorization: Option<String>,
    body: PublicKeyBody,
    users: Arc<UserDirectory>,
) -> Result<Response, warp::Rejection> {
    let Some(token) = extract_token(None, authorization.as_deref()) else {
        return Ok(error_reply(&AuthError::MissingToken));
    };
    let key = match parse_public_key_hex(&body.pubkey) {
        Ok(key) => key,
        Err(e) => return Ok(json_reply(&ErrorResponse::new(e), StatusCode::BAD_REQUEST)),
    };

    Ok(match users.publish_public_key(&token, &username, key) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_reply(&e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{IdentityKeys, TokenIssuer};

    fn users() -> Arc<UserDirectory> {
        let tokens = TokenIssuer::new(b"identity-server-test").unwrap();
        Arc::new(UserDirectory::new(tokens).with_password_rounds(1_000))
    }

    fn alice() -> Credentials {
        Credentials::new("alice", "wonderland")
    }

    #[tokio::test]
    async fn test_register_then_conflict() {
        let users = users();

        let first = handle_register(alice(), users.clone()).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = handle_register(alice(), users.clone()).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(users.user_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_username_is_bad_request() {
        let response = handle_register(Credentials::new("no spaces", "pw"), users())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_login() {
        let users = users();
        users.register(&alice()).unwrap();

        let ok = handle_login(alice(), users.clone()).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let wrong = handle_login(Credentials::new("alice", "nope"), users.clone())
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_refresh_rejects_garbage() {
        let users = users();
        let bad = handle_refresh(
            TokenRequest {
                token: "garbage".to_string(),
            },
            users.clone(),
        )
        .await
        .unwrap();
        assert_eq!(bad.status(), StatusCode::UNAUTHORIZED);

        users.register(&alice()).unwrap();
        let token = users.authenticate(&alice()).unwrap();
        let good = handle_refresh(TokenRequest { token }, users).await.unwrap();
        assert_eq!(good.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_publish_and_fetch_public_key() {
        let users = users();
        users.register(&alice()).unwrap();
        users.register(&Credentials::new("bob", "builder")).unwrap();
        let alice_token = users.authenticate(&alice()).unwrap();
        let keys = IdentityKeys::generate();
        let body = || PublicKeyBody {
            pubkey: keys.public_key_hex(),
        };

        let missing = handle_get_public_key("alice".to_string(), users.clone())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let unauthenticated =
            handle_put_public_key("alice".to_string(), None, body(), users.clone())
                .await
                .unwrap();
        assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

        let forbidden = handle_put_public_key(
            "bob".to_string(),
            Some(format!("Bearer {alice_token}")),
            body(),
            users.clone(),
        )
        .await
        .unwrap();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let published = handle_put_public_key(
            "alice".to_string(),
            Some(format!("Bearer {alice_token}")),
            body(),
            users.clone(),
        )
        .await
        .unwrap();
        assert_eq!(published.status(), StatusCode::NO_CONTENT);

        let found = handle_get_public_key("alice".to_string(), users.clone())
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        assert_eq!(users.public_key_of("alice"), Some(keys.public_key()));
    }

    #[tokio::test]
    async fn test_malformed_public_key() {
        let users = users();
        users.register(&alice()).unwrap();
        let token = users.authenticate(&alice()).unwrap();

        let response = handle_put_public_key(
            "alice".to_string(),
            Some(format!("Bearer {token}")),
            PublicKeyBody {
                pubkey: "abcd".to_string(),
            },
            users,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
