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
#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
extern crate tracing;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;

use wolkentor_unix_common::client::{BrokerClient, SessionOutcome};
use wolkentor_unix_common::config::{ConfigurationKey, ConfigurationStore};
use wolkentor_unix_common::coordinator::{Coordinator, EventSink, RunOutcome};
use wolkentor_unix_common::errors::AuthError;
use wolkentor_unix_common::oidc::{DeviceAuthGrant, OidcToken};
use wolkentor_unix_common::proto::{LOG_LEVEL_DEBUG, LOG_LEVEL_ERROR, LOG_LEVEL_WARN};
use wolkentor_unix_common::users::ensure::{Ensurer, ExecEnsurer, SystemExecutor};
use wolkentor_unix_common::users::repository::IdentityRepository;

#[derive(Parser)]
#[command(name = "wolkentor-tool", version, about = "Wolkentor management and login utility")]
struct Cli {
    /// Show extra debug information
    #[arg(short, long)]
    debug: bool,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate a username through the running broker daemon
    Auth {
        /// The requested username
        #[arg(long)]
        user: String,
        /// The configuration to authenticate against
        #[arg(long, default_value = "default")]
        key: String,
        /// Override the broker socket path
        #[arg(long)]
        socket: Option<String>,
    },
    /// Run the full device flow in-process, without the daemon
    TestFlow {
        /// The requested username
        #[arg(long)]
        user: String,
        /// The configuration to authenticate against
        #[arg(long, default_value = "default")]
        key: String,
    },
    /// List the configured configuration keys
    Keys,
}

/// Prints run milestones to the terminal.
struct StdoutEventSink;

#[async_trait]
impl EventSink for StdoutEventSink {
    async fn on_device_auth_started(&self, grant: &DeviceAuthGrant) -> Result<(), AuthError> {
        match grant.verification_uri_complete() {
            Some(uri) => println!(
                "Open {} in your browser and approve the login request. Waiting for approval...",
                uri
            ),
            None => println!(
                "Open {} in your browser and enter the code {}. Waiting for approval...",
                grant.verification_uri(),
                grant.user_code()
            ),
        }
        Ok(())
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

async fn auth(
    store: &ConfigurationStore,
    user: &str,
    key: &str,
    socket: Option<String>,
) -> Result<ExitCode> {
    let key = ConfigurationKey::parse(key)?;
    let socket_path = socket.unwrap_or_else(|| store.global().socket_path.clone());
    let client = BrokerClient::connect(&socket_path).await?;
    let client_info = format!("wolkentor-tool/{}", env!("CARGO_PKG_VERSION"));

    let outcome = client
        .authenticate(
            user,
            &key,
            &client_info,
            |message| println!("{}", message),
            |level, message| match level {
                LOG_LEVEL_ERROR => error!("{}", message),
                LOG_LEVEL_WARN => warn!("{}", message),
                LOG_LEVEL_DEBUG => debug!("{}", message),
                _ => info!("{}", message),
            },
        )
        .await?;

    match outcome {
        SessionOutcome::Success {
            local_user,
            local_uid,
            local_group,
            local_gid,
            ..
        } => {
            println!(
                "Authorized as local user {} (uid={}, group={}, gid={})",
                local_user, local_uid, local_group, local_gid
            );
            Ok(ExitCode::SUCCESS)
        }
        SessionOutcome::Failed { result, message } => {
            eprintln!("Authorization failed ({}): {}", result, message);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn test_flow(store: &ConfigurationStore, user: &str, key: &str) -> Result<ExitCode> {
    let key = ConfigurationKey::parse(key)?;
    let configuration = store
        .get(&key)
        .ok_or_else(|| anyhow!("no such configuration: {}", key))?;

    let global = store.global();
    let repository = Arc::new(
        IdentityRepository::open(
            &global.passwd_file,
            &global.group_file,
            &global.shadow_file,
            global.allow_bad_name,
            global.allow_bad_line,
        )
        .context("cannot open identity repository")?,
    );
    let ensurer: Arc<dyn Ensurer> = Arc::new(ExecEnsurer::new(
        repository,
        Arc::new(SystemExecutor),
        global.default_group.clone(),
    ));

    let coordinator = Coordinator::new(configuration, ensurer, Arc::new(StdoutEventSink));
    match coordinator.run(user).await {
        Ok(RunOutcome::Success(local_user)) => {
            println!("Authorized as local user {}", local_user);
            Ok(ExitCode::SUCCESS)
        }
        Ok(RunOutcome::Rejected) => {
            eprintln!("Requesting name {:?} is forbidden by configuration", user);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            eprintln!("Authorization failed: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn keys(store: &ConfigurationStore) -> Result<ExitCode> {
    for key in store.keys() {
        println!("{}", key);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.debug {
        std::env::set_var("RUST_LOG", "debug");
    }
    tracing_subscriber::fmt::init();

    let store = match ConfigurationStore::load(cli.config.as_deref()) {
        Ok(store) => store,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Auth { user, key, socket } => auth(&store, &user, &key, socket).await,
        Commands::TestFlow { user, key } => test_flow(&store, &user, &key).await,
        Commands::Keys => keys(&store),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
