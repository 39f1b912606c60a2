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

//! The PAM authentication module: resolves the requested username from the
//! host conversation, runs the full device-flow coordinator in-process and
//! maps the outcome to a PAM result code.
//!
//! Service-file options: `debug`, `config=<path>`, `key=<configuration>`.

pub mod constants;
pub mod conv;
#[doc(hidden)]
pub mod macros;
pub mod module;

use std::ffi::CStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use wolkentor_unix_common::config::{ConfigurationKey, ConfigurationStore, EnsureBackend};
use wolkentor_unix_common::coordinator::{Coordinator, EventSink, RunOutcome};
use wolkentor_unix_common::errors::AuthError;
use wolkentor_unix_common::oidc::{DeviceAuthGrant, OidcToken};
use wolkentor_unix_common::pam::Options;
use wolkentor_unix_common::proto::ResultCode;
use wolkentor_unix_common::users::ensure::{
    DirectEnsurer, Ensurer, ExecEnsurer, SystemExecutor,
};
use wolkentor_unix_common::users::repository::IdentityRepository;

use crate::pam::constants::*;
use crate::pam::conv::PamConv;
use crate::pam::module::{PamHandle, PamHooks};
use crate::pam_hooks;

fn install_subscriber(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false);

    let filter_layer = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::ERROR
    };

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init();
}

/// Shows run milestones to the user through the PAM conversation.
struct ConvEventSink {
    conv: PamConv,
}

impl ConvEventSink {
    fn print(&self, msg: &str) -> Result<(), AuthError> {
        self.conv
            .send(PAM_TEXT_INFO, msg)
            .map(|_| ())
            .map_err(|e| AuthError::system(format!("PAM conversation failed: {:?}", e)))
    }
}

#[async_trait]
impl EventSink for ConvEventSink {
    async fn on_device_auth_started(&self, grant: &DeviceAuthGrant) -> Result<(), AuthError> {
        match grant.verification_uri_complete() {
            Some(uri) => self.print(&format!(
                "Open {} in your browser and approve the login request. Waiting for approval...",
                uri
            )),
            None => self.print(&format!(
                "Open {} in your browser and enter the code {}. Waiting for approval...",
                grant.verification_uri(),
                grant.user_code()
            )),
        }
    }

    async fn on_token_received(&self, _token: &OidcToken) -> Result<(), AuthError> {
        debug!("token received");
        Ok(())
    }

    async fn on_id_token_received(&self, _claims: &Value) -> Result<(), AuthError> {
        debug!("id token received");
        Ok(())
    }

    async fn on_user_info_received(&self, _claims: &Value) -> Result<(), AuthError> {
        debug!("user info received");
        Ok(())
    }
}

pub struct PamWolkentor;

pam_hooks!(PamWolkentor);

impl PamHooks for PamWolkentor {
    fn sm_authenticate(pamh: &PamHandle, args: Vec<&CStr>, _flags: PamFlag) -> PamResultCode {
        let opts = match Options::try_from(&args) {
            Ok(o) => o,
            Err(_) => return PamResultCode::PAM_SERVICE_ERR,
        };

        install_subscriber(opts.debug);

        let account_id = match pamh.get_user(None) {
            Ok(aid) => aid,
            Err(e) => {
                error!(err = ?e, "get_user");
                return PamResultCode::PAM_SERVICE_ERR;
            }
        };
        if account_id.is_empty() {
            return PamResultCode::PAM_USER_UNKNOWN;
        }

        let conv = match pamh.get_conv() {
            Ok(conv) => conv,
            Err(e) => {
                error!(err = ?e, "get_conv");
                return e;
            }
        };

        let store = match ConfigurationStore::load(opts.config_path.as_deref()) {
            Ok(store) => store,
            Err(e) => {
                error!("{}", e);
                return PamResultCode::PAM_SERVICE_ERR;
            }
        };
        let key = match &opts.configuration_key {
            Some(raw) => match ConfigurationKey::parse(raw) {
                Ok(key) => key,
                Err(e) => {
                    error!("{}", e);
                    return PamResultCode::PAM_SERVICE_ERR;
                }
            },
            None => ConfigurationKey::default(),
        };
        let Some(configuration) = store.get(&key) else {
            error!("no such configuration: {}", key);
            return PamResultCode::PAM_SERVICE_ERR;
        };

        let global = store.global();
        let repository = match IdentityRepository::open(
            &global.passwd_file,
            &global.group_file,
            &global.shadow_file,
            global.allow_bad_name,
            global.allow_bad_line,
        ) {
            Ok(repository) => Arc::new(repository),
            Err(e) => {
                error!("{}", e);
                return PamResultCode::PAM_SYSTEM_ERR;
            }
        };
        let ensurer: Arc<dyn Ensurer> = match global.ensure_backend {
            EnsureBackend::Exec => Arc::new(ExecEnsurer::new(
                repository,
                Arc::new(SystemExecutor),
                global.default_group.clone(),
            )),
            EnsureBackend::Direct => {
                Arc::new(DirectEnsurer::new(repository, global.default_group.clone()))
            }
        };

        let coordinator = Coordinator::new(
            configuration,
            ensurer,
            Arc::new(ConvEventSink { conv }),
        );

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(err = ?e, "cannot start async runtime");
                return PamResultCode::PAM_SERVICE_ERR;
            }
        };

        match runtime.block_on(coordinator.run(&account_id)) {
            Ok(RunOutcome::Success(user)) => {
                if let Err(e) = pamh.set_user(&user.name) {
                    error!(err = ?e, "cannot switch to local user {}", user);
                    return PamResultCode::PAM_SYSTEM_ERR;
                }
                debug!("remote user {:?} authorized as local user {}", account_id, user);
                PamResultCode::PAM_SUCCESS
            }
            Ok(RunOutcome::Rejected) => {
                debug!("remote user {:?} is forbidden by configuration", account_id);
                PamResultCode::PAM_USER_UNKNOWN
            }
            Err(e) => {
                if matches!(e.result, ResultCode::OidcAuthorizeTimeout) {
                    debug!("{}", e);
                } else {
                    error!("{}", e);
                }
                match e.result {
                    ResultCode::OidcAuthorizeTimeout => PamResultCode::PAM_IGNORE,
                    ResultCode::LoginForbidden => PamResultCode::PAM_CRED_INSUFFICIENT,
                    ResultCode::NoSuchUser => PamResultCode::PAM_USER_UNKNOWN,
                    ResultCode::ConfigurationErr => PamResultCode::PAM_SERVICE_ERR,
                    _ => PamResultCode::PAM_SYSTEM_ERR,
                }
            }
        }
    }

    /// Credential establishment is deferred to the OS session stack.
    fn sm_setcred(_pamh: &PamHandle, _args: Vec<&CStr>, _flags: PamFlag) -> PamResultCode {
        PamResultCode::PAM_SUCCESS
    }
}
