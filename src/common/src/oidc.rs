/*
   Wolkentor: OIDC device-flow logins for Unix hosts
   Copyright (C) David Mulder <dmulder@samba.org> 2025

   This program is free software; you can redistribute it and/or modify
   it under the terms of the GNU General Public License as published by
   the Free Software Foundation; either version 3 of the License, or
   (at your option) any later version.

   This program is distributed in the hope that it will be useful,
   but WITHOUT ANY WARRANTY; without even the implied warranty of
   MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
   GNU General Public License for more details.

   You should have received a copy of the GNU General Public License
   along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! The OIDC device-authorization client.
//!
//! The lifecycle is linear: discovery at construction, device-auth
//! initiation, token polling, ID-token verification, userinfo retrieval.
//! Deadline expiry during token polling is a user-class condition (the
//! human did not approve in time), distinct from transport failures.

use std::time::Duration;

use oauth2::basic::BasicTokenType;
use oauth2::{
    DeviceAuthorizationResponse, EmptyExtraTokenFields, RequestTokenError, StandardTokenResponse,
};
use openidconnect::core::{
    CoreAuthDisplay, CoreClaimName, CoreClaimType, CoreClient, CoreClientAuthMethod,
    CoreGenderClaim, CoreGrantType, CoreJsonWebKey, CoreJweContentEncryptionAlgorithm,
    CoreJweKeyManagementAlgorithm, CoreJwsSigningAlgorithm, CoreResponseMode, CoreResponseType,
    CoreSubjectIdentifierType, CoreUserInfoClaims,
};
use openidconnect::{
    AccessToken, AdditionalProviderMetadata, AuthType, ClientId, ClientSecret,
    DeviceAuthorizationUrl, EmptyAdditionalClaims, EmptyExtraDeviceAuthorizationFields,
    EndpointMaybeSet, EndpointNotSet, EndpointSet, IdTokenFields, IssuerUrl, Nonce,
    OAuth2TokenResponse, ProviderMetadata, Scope, TokenResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::config::Configuration;
use crate::errors::{AuthError, ErrorKind};

#[derive(Clone, Debug, Deserialize, Serialize)]
struct DeviceEndpointProviderMetadata {
    device_authorization_endpoint: DeviceAuthorizationUrl,
}

impl AdditionalProviderMetadata for DeviceEndpointProviderMetadata {}

type DeviceProviderMetadata = ProviderMetadata<
    DeviceEndpointProviderMetadata,
    CoreAuthDisplay,
    CoreClientAuthMethod,
    CoreClaimName,
    CoreClaimType,
    CoreGrantType,
    CoreJweContentEncryptionAlgorithm,
    CoreJweKeyManagementAlgorithm,
    CoreJsonWebKey,
    CoreResponseMode,
    CoreResponseType,
    CoreSubjectIdentifierType,
>;

type DagClient = CoreClient<
    EndpointSet,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointMaybeSet,
    EndpointMaybeSet,
>;

type OidcTokenResponse = StandardTokenResponse<
    IdTokenFields<
        EmptyAdditionalClaims,
        EmptyExtraTokenFields,
        CoreGenderClaim,
        CoreJweContentEncryptionAlgorithm,
        CoreJwsSigningAlgorithm,
    >,
    BasicTokenType,
>;

/// A started device-authorization flow: what to show the user, and the
/// device code the token endpoint is polled with.
pub struct DeviceAuthGrant {
    details: DeviceAuthorizationResponse<EmptyExtraDeviceAuthorizationFields>,
}

impl DeviceAuthGrant {
    pub fn verification_uri(&self) -> &str {
        self.details.verification_uri()
    }

    pub fn verification_uri_complete(&self) -> Option<&str> {
        self.details
            .verification_uri_complete()
            .map(|v| v.secret().as_str())
    }

    pub fn user_code(&self) -> &str {
        self.details.user_code().secret()
    }

    pub fn interval(&self) -> Duration {
        self.details.interval()
    }

    pub fn expires_in(&self) -> Duration {
        self.details.expires_in()
    }
}

/// The token response of a completed device flow.
pub struct OidcToken {
    response: OidcTokenResponse,
}

impl OidcToken {
    pub fn access_token(&self) -> &AccessToken {
        self.response.access_token()
    }

    /// The token as seen by the requirement templates.
    pub fn context_value(&self) -> Value {
        serde_json::json!({
            "access_token": self.response.access_token().secret(),
            "token_type": serde_json::to_value(self.response.token_type())
                .unwrap_or(Value::Null),
            "expires_in": self.response.expires_in().map(|d| d.as_secs()),
            "scopes": serde_json::to_value(self.response.scopes()).unwrap_or(Value::Null),
        })
    }
}

enum PollDisposition {
    Pending,
    SlowDown,
    Denied,
    Expired,
    Other,
}

// RFC 8628 token endpoint error codes.
fn classify_poll_error(error: &str) -> PollDisposition {
    match error {
        "authorization_pending" => PollDisposition::Pending,
        "slow_down" => PollDisposition::SlowDown,
        "access_denied" => PollDisposition::Denied,
        "expired_token" => PollDisposition::Expired,
        _ => PollDisposition::Other,
    }
}

/// Elapsing of the caller's deadline while polling means the human did not
/// approve in time: a user-class outcome, never a transport fault.
fn poll_deadline_error(now: Instant, deadline: Option<Instant>) -> Option<AuthError> {
    match deadline {
        Some(deadline) if now >= deadline => {
            Some(AuthError::user("authorize of device timed out"))
        }
        _ => None,
    }
}

pub struct OidcClient {
    client: DagClient,
    http_client: reqwest::Client,
    scopes: Vec<Scope>,
}

impl OidcClient {
    /// Performs provider discovery for the configured issuer. Failures here
    /// are configuration-class: a bad issuer URL or an unreachable provider.
    #[instrument(level = "debug", skip_all, fields(issuer = %configuration.issuer))]
    pub async fn discover(configuration: &Configuration) -> Result<Self, AuthError> {
        let issuer_url = IssuerUrl::new(configuration.issuer.clone()).map_err(|e| {
            AuthError::with_source(
                ErrorKind::Configuration,
                format!("invalid OIDC issuer URL {:?}", configuration.issuer),
                e,
            )
        })?;

        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                AuthError::with_source(
                    ErrorKind::Configuration,
                    "cannot build HTTP client for OIDC",
                    e,
                )
            })?;

        let provider_metadata = DeviceProviderMetadata::discover_async(issuer_url, &http_client)
            .await
            .map_err(|e| {
                AuthError::with_source(
                    ErrorKind::Configuration,
                    format!("cannot evaluate OIDC issuer {:?}", configuration.issuer),
                    e,
                )
            })?;

        let device_endpoint = provider_metadata
            .additional_metadata()
            .device_authorization_endpoint
            .clone();

        let client = CoreClient::from_provider_metadata(
            provider_metadata,
            ClientId::new(configuration.client_id.clone()),
            configuration.client_secret.clone().map(ClientSecret::new),
        )
        .set_device_authorization_url(device_endpoint)
        .set_auth_type(AuthType::RequestBody);

        Ok(OidcClient {
            client,
            http_client,
            scopes: configuration
                .scopes
                .iter()
                .map(|s| Scope::new(s.clone()))
                .collect(),
        })
    }

    /// Calls the provider's device-authorization endpoint.
    #[instrument(level = "debug", skip_all)]
    pub async fn initiate_device_auth(&self) -> Result<DeviceAuthGrant, AuthError> {
        let details = self
            .client
            .exchange_device_code()
            .add_scopes(self.scopes.clone())
            .request_async(&self.http_client)
            .await
            .map_err(|e| match e {
                RequestTokenError::Request(re) => AuthError::with_source(
                    ErrorKind::Network,
                    "cannot initiate successful device auth",
                    re,
                ),
                other => AuthError::with_source(
                    ErrorKind::Network,
                    "cannot initiate successful device auth",
                    other,
                ),
            })?;
        Ok(DeviceAuthGrant { details })
    }

    /// Polls the token endpoint at the provider-specified interval until
    /// the user approves, the device code expires, or the deadline elapses.
    /// The deadline case is classified as a user timeout, not a fault.
    #[instrument(level = "debug", skip_all)]
    pub async fn retrieve_device_auth_token(
        &self,
        grant: &DeviceAuthGrant,
        deadline: Option<Instant>,
    ) -> Result<OidcToken, AuthError> {
        let token_url = self
            .client
            .token_uri()
            .map(|u| u.url().clone())
            .ok_or_else(|| {
                AuthError::configuration("issuer metadata does not carry a token endpoint")
            })?;

        let device_code = grant.details.device_code().secret().clone();
        let client_id = self.client.client_id().as_str().to_owned();

        #[derive(Serialize)]
        struct DeviceAccessTokenRequest<'a> {
            grant_type: &'static str,
            device_code: &'a str,
            client_id: &'a str,
        }

        let body = DeviceAccessTokenRequest {
            grant_type: "urn:ietf:params:oauth:grant-type:device_code",
            device_code: &device_code,
            client_id: &client_id,
        };

        let mut interval = grant.interval();
        if interval.is_zero() {
            interval = Duration::from_secs(5);
        }
        let expires_at = Instant::now() + grant.expires_in();

        loop {
            let now = Instant::now();
            if let Some(err) = poll_deadline_error(now, deadline) {
                return Err(err);
            }
            if now >= expires_at {
                return Err(AuthError::permission("device code expired during device flow"));
            }

            // Sleep at most until the deadline so cancellation is prompt.
            let sleep_for = match deadline {
                Some(deadline) => interval.min(deadline.saturating_duration_since(now)),
                None => interval,
            };
            tokio::time::sleep(sleep_for).await;
            if let Some(err) = poll_deadline_error(Instant::now(), deadline) {
                return Err(err);
            }

            let resp = self
                .http_client
                .post(token_url.clone())
                .header(reqwest::header::ACCEPT, "application/json")
                .form(&body)
                .send()
                .await
                .map_err(|e| {
                    AuthError::with_source(
                        ErrorKind::Network,
                        "cannot send device access token request",
                        e,
                    )
                })?;
            let status = resp.status();
            let bytes = resp.bytes().await.map_err(|e| {
                AuthError::with_source(
                    ErrorKind::Network,
                    "cannot read device access token response",
                    e,
                )
            })?;

            if status.is_success() {
                let response: OidcTokenResponse =
                    serde_json::from_slice(&bytes).map_err(|e| {
                        AuthError::with_source(
                            ErrorKind::Network,
                            "cannot parse device access token response",
                            e,
                        )
                    })?;
                return Ok(OidcToken { response });
            }

            #[derive(Deserialize, Debug)]
            struct DeviceAccessTokenErrorResponse {
                error: String,
                error_description: Option<String>,
            }

            let err: DeviceAccessTokenErrorResponse =
                serde_json::from_slice(&bytes).map_err(|e| {
                    error!(
                        ?status,
                        body = %String::from_utf8_lossy(&bytes),
                        "unexpected device access token response"
                    );
                    AuthError::with_source(
                        ErrorKind::Network,
                        "cannot parse device access token error response",
                        e,
                    )
                })?;

            match classify_poll_error(&err.error) {
                PollDisposition::Pending => {
                    debug!("device flow still pending; polling again");
                }
                PollDisposition::SlowDown => {
                    debug!("provider asked to slow down; raising the polling interval");
                    interval += Duration::from_secs(5);
                }
                PollDisposition::Denied => {
                    return Err(AuthError::permission(
                        "user denied authorization during device flow",
                    ));
                }
                PollDisposition::Expired => {
                    return Err(AuthError::permission(
                        "device code expired during device flow",
                    ));
                }
                PollDisposition::Other => {
                    return Err(AuthError::network(format!(
                        "device flow failed with error: {} ({})",
                        err.error,
                        err.error_description.unwrap_or_default()
                    )));
                }
            }
        }
    }

    /// Extracts and cryptographically verifies the ID token embedded in the
    /// token response, returning its decoded claim map.
    #[instrument(level = "debug", skip_all)]
    pub fn verify_token(&self, token: &OidcToken) -> Result<Value, AuthError> {
        let id_token = token.response.id_token().ok_or_else(|| {
            AuthError::permission("token response does not contain an id_token")
        })?;
        let verifier = self.client.id_token_verifier();
        let claims = id_token
            .claims(&verifier, |_: Option<&Nonce>| Ok(()))
            .map_err(|e| {
                AuthError::with_source(ErrorKind::Permission, "cannot verify ID token", e)
            })?;
        serde_json::to_value(claims).map_err(|e| {
            AuthError::with_source(ErrorKind::System, "cannot decode ID token claims", e)
        })
    }

    /// Fetches the userinfo endpoint with the access token as bearer
    /// credential, returning the decoded claim map.
    #[instrument(level = "debug", skip_all)]
    pub async fn get_user_info(&self, token: &OidcToken) -> Result<Value, AuthError> {
        let userinfo: CoreUserInfoClaims = self
            .client
            .user_info(token.access_token().clone(), None)
            .map_err(|e| {
                AuthError::with_source(
                    ErrorKind::Configuration,
                    "cannot build userinfo request",
                    e,
                )
            })?
            .request_async(&self.http_client)
            .await
            .map_err(|e| {
                AuthError::with_source(ErrorKind::Permission, "cannot retrieve user info", e)
            })?;
        serde_json::to_value(userinfo).map_err(|e| {
            AuthError::with_source(ErrorKind::System, "cannot decode user info claims", e)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_deadline_elapse_is_a_user_timeout() {
        let now = Instant::now();
        assert!(poll_deadline_error(now, None).is_none());
        assert!(poll_deadline_error(now, Some(now + Duration::from_secs(30))).is_none());

        let err = poll_deadline_error(now + Duration::from_secs(31), Some(now)).unwrap();
        assert_eq!(err.kind(), ErrorKind::User);
    }

    #[test]
    fn test_poll_error_classification() {
        assert!(matches!(
            classify_poll_error("authorization_pending"),
            PollDisposition::Pending
        ));
        assert!(matches!(
            classify_poll_error("slow_down"),
            PollDisposition::SlowDown
        ));
        assert!(matches!(
            classify_poll_error("access_denied"),
            PollDisposition::Denied
        ));
        assert!(matches!(
            classify_poll_error("expired_token"),
            PollDisposition::Expired
        ));
        assert!(matches!(
            classify_poll_error("server_error"),
            PollDisposition::Other
        ));
    }
}
