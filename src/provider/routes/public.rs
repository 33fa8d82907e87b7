use crate::errors::OAuthError;
use crate::provider::provider::Provider;
use crate::provider::routes::{
    parse_oauth_body, read_oauth_body, ApiResponse, DpopProof,
};
use crate::types::{
    ClientCredentials, IntrospectionResponse, ParRequest, ParResponse, ServerMetadata,
    TokenIdentification, TokenRequest, TokenResponse,
};
use jsonwebtoken::jwk::JwkSet;
use rocket::data::Outcome as DataOutcome;
use rocket::data::FromData;
use rocket::http::Status;
use rocket::{get, options, post, Data, Request, State};

#[get("/.well-known/oauth-authorization-server")]
pub async fn oauth_well_known(provider: &State<Provider>) -> ApiResponse<ServerMetadata> {
    ApiResponse::new(Ok(provider.metadata.clone()), None)
}

#[get("/oauth/jwks")]
pub async fn oauth_jwks(provider: &State<Provider>) -> ApiResponse<JwkSet> {
    ApiResponse::new(Ok(provider.get_jwks()), None)
}

/// CORS preflight for the public endpoints.
#[options("/oauth/<_path..>")]
pub fn oauth_preflight(_path: std::path::PathBuf) -> ApiResponse<()> {
    ApiResponse {
        body: Ok(()),
        status: Status::NoContent,
        dpop_nonce: None,
    }
}

pub struct ParEndpointBody {
    pub credentials: ClientCredentials,
    pub request: ParRequest,
}

#[rocket::async_trait]
impl<'r> FromData<'r> for ParEndpointBody {
    type Error = OAuthError;

    #[tracing::instrument(skip_all)]
    async fn from_data(req: &'r Request<'_>, data: Data<'r>) -> DataOutcome<'r, Self> {
        let (encoding, body) = match read_oauth_body(req, data).await {
            Ok(read) => read,
            Err(error) => return DataOutcome::Error((Status::BadRequest, error)),
        };
        let credentials = match parse_oauth_body(encoding, &body, "client authentication") {
            Ok(credentials) => credentials,
            Err(error) => return DataOutcome::Error((Status::BadRequest, error)),
        };
        let request = match parse_oauth_body(encoding, &body, "authorization request") {
            Ok(request) => request,
            Err(error) => return DataOutcome::Error((Status::BadRequest, error)),
        };
        DataOutcome::Success(ParEndpointBody {
            credentials,
            request,
        })
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc9126>
#[post("/oauth/par", data = "<body>")]
#[tracing::instrument(skip_all)]
pub async fn oauth_par(
    provider: &State<Provider>,
    body: Result<ParEndpointBody, OAuthError>,
    dpop: DpopProof,
) -> ApiResponse<ParResponse> {
    let dpop_nonce = provider.next_dpop_nonce().await;
    let body = match body {
        Ok(body) => body,
        Err(error) => return ApiResponse::new(Err(error), dpop_nonce),
    };

    let dpop_jkt = match dpop.0 {
        None => None,
        Some(proof) => {
            let htu = provider.verifier.issuer.endpoint("/oauth/par");
            match provider
                .verifier
                .check_dpop_proof(&proof, "POST", &htu, None)
                .await
            {
                Ok(checked) => Some(checked.jkt),
                Err(error) => return ApiResponse::new(Err(error), dpop_nonce),
            }
        }
    };

    ApiResponse::created(
        provider
            .pushed_authorization_request(body.credentials, body.request, dpop_jkt)
            .await,
        dpop_nonce,
    )
}

pub struct TokenEndpointBody {
    pub credentials: ClientCredentials,
    pub request: TokenRequest,
}

#[rocket::async_trait]
impl<'r> FromData<'r> for TokenEndpointBody {
    type Error = OAuthError;

    #[tracing::instrument(skip_all)]
    async fn from_data(req: &'r Request<'_>, data: Data<'r>) -> DataOutcome<'r, Self> {
        let (encoding, body) = match read_oauth_body(req, data).await {
            Ok(read) => read,
            Err(error) => return DataOutcome::Error((Status::BadRequest, error)),
        };
        let credentials = match parse_oauth_body(encoding, &body, "client authentication") {
            Ok(credentials) => credentials,
            Err(error) => return DataOutcome::Error((Status::BadRequest, error)),
        };
        let request = match parse_oauth_body::<TokenRequest>(encoding, &body, "grant") {
            Ok(request) => request,
            // A malformed grant body is an invalid_grant, not a schema
            // error on the credentials.
            Err(error) => {
                return DataOutcome::Error((
                    Status::BadRequest,
                    OAuthError::InvalidGrant(error.to_string()),
                ))
            }
        };
        DataOutcome::Success(TokenEndpointBody {
            credentials,
            request,
        })
    }
}

#[post("/oauth/token", data = "<body>")]
#[tracing::instrument(skip_all)]
pub async fn oauth_token(
    provider: &State<Provider>,
    body: Result<TokenEndpointBody, OAuthError>,
    dpop: DpopProof,
) -> ApiResponse<TokenResponse> {
    let dpop_nonce = provider.next_dpop_nonce().await;
    let body = match body {
        Ok(body) => body,
        Err(error) => return ApiResponse::new(Err(error), dpop_nonce),
    };

    let dpop_jkt = match dpop.0 {
        None => None,
        Some(proof) => {
            let htu = provider.verifier.issuer.endpoint("/oauth/token");
            match provider
                .verifier
                .check_dpop_proof(&proof, "POST", &htu, None)
                .await
            {
                Ok(checked) => Some(checked.jkt),
                Err(error) => return ApiResponse::new(Err(error), dpop_nonce),
            }
        }
    };

    ApiResponse::new(
        provider.token(body.credentials, body.request, dpop_jkt).await,
        dpop_nonce,
    )
}

pub struct RevokeEndpointBody {
    pub token: TokenIdentification,
}

#[rocket::async_trait]
impl<'r> FromData<'r> for RevokeEndpointBody {
    type Error = OAuthError;

    #[tracing::instrument(skip_all)]
    async fn from_data(req: &'r Request<'_>, data: Data<'r>) -> DataOutcome<'r, Self> {
        let (encoding, body) = match read_oauth_body(req, data).await {
            Ok(read) => read,
            Err(error) => return DataOutcome::Error((Status::BadRequest, error)),
        };
        match parse_oauth_body(encoding, &body, "token") {
            Ok(token) => DataOutcome::Success(RevokeEndpointBody { token }),
            Err(error) => DataOutcome::Error((Status::BadRequest, error)),
        }
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc7009>
///
/// Always answers 200, even for unknown tokens (section 2.2).
#[post("/oauth/revoke", data = "<body>")]
#[tracing::instrument(skip_all)]
pub async fn oauth_revoke(
    provider: &State<Provider>,
    body: Result<RevokeEndpointBody, OAuthError>,
) -> ApiResponse<serde_json::Value> {
    if let Ok(body) = body {
        if let Err(error) = provider.revoke(&body.token).await {
            tracing::debug!(%error, "revocation failed");
        }
    }
    ApiResponse::new(Ok(serde_json::json!({})), None)
}

pub struct IntrospectEndpointBody {
    pub credentials: ClientCredentials,
    pub token: TokenIdentification,
}

#[rocket::async_trait]
impl<'r> FromData<'r> for IntrospectEndpointBody {
    type Error = OAuthError;

    #[tracing::instrument(skip_all)]
    async fn from_data(req: &'r Request<'_>, data: Data<'r>) -> DataOutcome<'r, Self> {
        let (encoding, body) = match read_oauth_body(req, data).await {
            Ok(read) => read,
            Err(error) => return DataOutcome::Error((Status::BadRequest, error)),
        };
        let credentials = match parse_oauth_body(encoding, &body, "client authentication") {
            Ok(credentials) => credentials,
            Err(error) => return DataOutcome::Error((Status::BadRequest, error)),
        };
        let token = match parse_oauth_body(encoding, &body, "token") {
            Ok(token) => token,
            Err(error) => return DataOutcome::Error((Status::BadRequest, error)),
        };
        DataOutcome::Success(IntrospectEndpointBody {
            credentials,
            token,
        })
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc7662>
#[post("/oauth/introspect", data = "<body>")]
#[tracing::instrument(skip_all)]
pub async fn oauth_introspect(
    provider: &State<Provider>,
    body: Result<IntrospectEndpointBody, OAuthError>,
) -> ApiResponse<IntrospectionResponse> {
    let body = match body {
        Ok(body) => body,
        Err(error) => return ApiResponse::new(Err(error), None),
    };
    ApiResponse::new(
        provider.introspect(body.credentials, body.token).await,
        None,
    )
}
