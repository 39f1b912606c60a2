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

//! Orchestration of one authentication run: username filters, the OIDC
//! exchange, requirement rendering, and identity reconciliation.
//!
//! Progress is reported through an injected [EventSink]; the sink's
//! failures abort the run. The username filters are applied before any
//! contact with the identity provider.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::Configuration;
use crate::errors::{AuthError, ErrorKind};
use crate::oidc::{DeviceAuthGrant, OidcClient, OidcToken};
use crate::proto::ResultCode;
use crate::users::ensure::{EnsureOpts, Ensurer};
use crate::users::User;

/// Milestone callbacks of one run. Implementations turn these into wire
/// frames, PAM conversation messages, or terminal output.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_device_auth_started(&self, grant: &DeviceAuthGrant) -> Result<(), AuthError> {
        let _ = grant;
        Ok(())
    }

    async fn on_token_received(&self, token: &OidcToken) -> Result<(), AuthError> {
        let _ = token;
        Ok(())
    }

    async fn on_id_token_received(&self, claims: &Value) -> Result<(), AuthError> {
        let _ = claims;
        Ok(())
    }

    async fn on_user_info_received(&self, claims: &Value) -> Result<(), AuthError> {
        let _ = claims;
        Ok(())
    }
}

/// An [EventSink] that swallows all milestones.
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {}

/// The outcome of a completed run that did not fail.
#[derive(Debug)]
pub enum RunOutcome {
    /// The user was authorized and the local identity reconciled.
    Success(User),
    /// The requested username was rejected by the allow/forbid filters;
    /// the identity provider was never contacted.
    Rejected,
}

/// A failed run: the error plus the [ResultCode] it is reported as.
#[derive(Debug)]
pub struct CoordinatorError {
    pub result: ResultCode,
    pub error: AuthError,
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.result, self.error)
    }
}

impl std::error::Error for CoordinatorError {}

/// Maps an error of the remote-authorization stage to the result code it
/// is reported as. A user-class error here means the human did not approve
/// in time; it must never surface as a plain authorize failure.
pub fn result_for_authorize_error(error: &AuthError) -> ResultCode {
    match error.kind() {
        ErrorKind::Configuration => ResultCode::ConfigurationErr,
        ErrorKind::User => ResultCode::OidcAuthorizeTimeout,
        ErrorKind::Network | ErrorKind::Permission => ResultCode::OidcAuthorizeFailed,
        ErrorKind::System => ResultCode::SystemErr,
    }
}

/// Builds the claims-shaped context the requirement templates render
/// against.
pub fn render_context(
    token: &OidcToken,
    id_token_claims: Option<&Value>,
    user_info_claims: Option<&Value>,
) -> Value {
    serde_json::json!({
        "oidc": {
            "token": token.context_value(),
            "id_token": {
                "claims": id_token_claims.cloned().unwrap_or(Value::Null),
            },
            "user_info": {
                "claims": user_info_claims.cloned().unwrap_or(Value::Null),
            },
        }
    })
}

pub struct Coordinator {
    configuration: Arc<Configuration>,
    ensurer: Arc<dyn Ensurer>,
    events: Arc<dyn EventSink>,
}

impl Coordinator {
    pub fn new(
        configuration: Arc<Configuration>,
        ensurer: Arc<dyn Ensurer>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Coordinator {
            configuration,
            ensurer,
            events,
        }
    }

    /// Runs the full flow with the deadline derived from the
    /// configuration's timeout.
    pub async fn run(&self, requested_username: &str) -> Result<RunOutcome, CoordinatorError> {
        let deadline = Instant::now() + self.configuration.timeout;
        self.run_with_deadline(requested_username, Some(deadline))
            .await
    }

    /// Runs the full flow. A deadline of `None` means no timeout.
    #[instrument(level = "debug", skip_all, fields(username = requested_username))]
    pub async fn run_with_deadline(
        &self,
        requested_username: &str,
        deadline: Option<Instant>,
    ) -> Result<RunOutcome, CoordinatorError> {
        if let Some(allowed) = &self.configuration.allowed_username {
            if !allowed.is_match(requested_username) {
                debug!(
                    "requested username {:?} does not match the allow filter; rejecting",
                    requested_username
                );
                return Ok(RunOutcome::Rejected);
            }
        }
        if let Some(forbidden) = &self.configuration.forbidden_username {
            if forbidden.is_match(requested_username) {
                debug!(
                    "requested username {:?} matches the forbid filter; rejecting",
                    requested_username
                );
                return Ok(RunOutcome::Rejected);
            }
        }

        let ctx = self.remote_authorize(deadline).await?;

        let requirement = self
            .configuration
            .user
            .render("user", &ctx)
            .map_err(|e| CoordinatorError {
                result: ResultCode::RequirementResolutionFailed,
                error: AuthError::configuration(format!(
                    "cannot render user requirement based on oidc information: {}",
                    e
                )),
            })?;

        let allowed = self
            .configuration
            .login_allowed
            .render(&ctx, true)
            .map_err(|e| CoordinatorError {
                result: ResultCode::LoginAllowedResolutionFailed,
                error: AuthError::configuration(format!(
                    "cannot evaluate if user is allowed to login: {}",
                    e
                )),
            })?;
        if !allowed {
            return Err(CoordinatorError {
                result: ResultCode::LoginForbidden,
                error: AuthError::permission(format!(
                    "user {} is not allowed to login",
                    requirement
                )),
            });
        }

        let opts = EnsureOpts {
            create_allowed: self.configuration.create_if_absent,
            modify_allowed: self.configuration.modify_if_different,
        };
        match self.ensurer.ensure(&requirement, opts).await {
            Ok(Some(user)) => {
                info!(
                    "remote user {:?} was successfully authorized as local user {}",
                    requested_username, user
                );
                Ok(RunOutcome::Success(user))
            }
            Ok(None) => Err(CoordinatorError {
                result: ResultCode::NoSuchUser,
                error: AuthError::user(format!(
                    "local user for {} does not exist and creating it is not allowed",
                    requirement
                )),
            }),
            Err(error) => Err(CoordinatorError {
                result: ResultCode::UserEnsuringFailed,
                error,
            }),
        }
    }

    async fn remote_authorize(
        &self,
        deadline: Option<Instant>,
    ) -> Result<Value, CoordinatorError> {
        let fail = |error: AuthError| CoordinatorError {
            result: result_for_authorize_error(&error),
            error,
        };

        let client = OidcClient::discover(&self.configuration).await.map_err(fail)?;

        let grant = client.initiate_device_auth().await.map_err(fail)?;
        self.events
            .on_device_auth_started(&grant)
            .await
            .map_err(fail)?;

        let token = client
            .retrieve_device_auth_token(&grant, deadline)
            .await
            .map_err(fail)?;
        self.events.on_token_received(&token).await.map_err(fail)?;

        let id_token_claims = if self.configuration.retrieve_id_token {
            let claims = client.verify_token(&token).map_err(fail)?;
            self.events
                .on_id_token_received(&claims)
                .await
                .map_err(fail)?;
            Some(claims)
        } else {
            None
        };

        let user_info_claims = if self.configuration.retrieve_user_info {
            let claims = client.get_user_info(&token).await.map_err(fail)?;
            self.events
                .on_user_info_received(&claims)
                .await
                .map_err(fail)?;
            Some(claims)
        } else {
            None
        };

        Ok(render_context(
            &token,
            id_token_claims.as_ref(),
            user_info_claims.as_ref(),
        ))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::ConfigurationKey;
    use crate::template::{
        BoolTemplate, GroupRequirementTemplate, RequirementTemplate, StringTemplate, UintTemplate,
    };
    use crate::users::ensure::{GroupRequirement, Requirement};
    use crate::users::Group;
    use regex::Regex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct RecordingEnsurer {
        called: AtomicBool,
    }

    #[async_trait]
    impl Ensurer for RecordingEnsurer {
        async fn ensure(
            &self,
            _req: &Requirement,
            _opts: EnsureOpts,
        ) -> Result<Option<User>, AuthError> {
            self.called.store(true, Ordering::Relaxed);
            Err(AuthError::system("not expected to be reached"))
        }

        async fn ensure_group(
            &self,
            _req: &GroupRequirement,
            _opts: EnsureOpts,
        ) -> Result<Option<Group>, AuthError> {
            self.called.store(true, Ordering::Relaxed);
            Err(AuthError::system("not expected to be reached"))
        }
    }

    fn configuration(
        allowed: Option<&str>,
        forbidden: Option<&str>,
    ) -> Arc<Configuration> {
        Arc::new(Configuration {
            key: ConfigurationKey::default(),
            // Unroutable on purpose: the filter paths must never get here.
            issuer: "https://127.0.0.1:1/realms/unreachable".to_string(),
            client_id: "test".to_string(),
            client_secret: None,
            scopes: vec!["openid".to_string()],
            timeout: Duration::from_secs(60),
            allowed_username: allowed.map(|p| Regex::new(p).unwrap()),
            forbidden_username: forbidden.map(|p| Regex::new(p).unwrap()),
            login_allowed: BoolTemplate::new(""),
            create_if_absent: true,
            modify_if_different: true,
            retrieve_id_token: true,
            retrieve_user_info: true,
            user: RequirementTemplate {
                name: StringTemplate::new("{{oidc.id_token.claims.email}}"),
                display_name: StringTemplate::new(""),
                uid: UintTemplate::new(""),
                group: GroupRequirementTemplate {
                    gid: UintTemplate::new(""),
                    name: StringTemplate::new("sso"),
                },
                groups: Vec::new(),
                shell: StringTemplate::new(""),
                home_dir: StringTemplate::new(""),
                skel: StringTemplate::new(""),
            },
        })
    }

    fn coordinator(configuration: Arc<Configuration>) -> (Coordinator, Arc<RecordingEnsurer>) {
        let ensurer = Arc::new(RecordingEnsurer {
            called: AtomicBool::new(false),
        });
        (
            Coordinator::new(configuration, ensurer.clone(), Arc::new(NullEventSink)),
            ensurer,
        )
    }

    #[tokio::test]
    async fn test_forbidden_username_rejects_before_any_network() {
        let (coordinator, ensurer) = coordinator(configuration(None, Some("^root$")));
        let outcome = coordinator.run("root").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Rejected));
        assert!(!ensurer.called.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_allow_filter_mismatch_rejects() {
        let (coordinator, ensurer) = coordinator(configuration(Some("^[a-z]+$"), None));
        let outcome = coordinator.run("Weird User").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Rejected));
        assert!(!ensurer.called.load(Ordering::Relaxed));
    }

    #[test]
    fn test_authorize_error_result_mapping() {
        assert_eq!(
            result_for_authorize_error(&AuthError::user("timed out")),
            ResultCode::OidcAuthorizeTimeout
        );
        assert_eq!(
            result_for_authorize_error(&AuthError::network("transport")),
            ResultCode::OidcAuthorizeFailed
        );
        assert_eq!(
            result_for_authorize_error(&AuthError::permission("bad token")),
            ResultCode::OidcAuthorizeFailed
        );
        assert_eq!(
            result_for_authorize_error(&AuthError::configuration("bad issuer")),
            ResultCode::ConfigurationErr
        );
        assert_eq!(
            result_for_authorize_error(&AuthError::system("io")),
            ResultCode::SystemErr
        );
    }
}
