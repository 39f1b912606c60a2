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

use std::ffi::CString;
use std::fs::{set_permissions, DirBuilder, Permissions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use wolkentor_unix_common::broker::{Broker, CoordinatorRunner};
use wolkentor_unix_common::config::{ConfigurationStore, EnsureBackend};
use wolkentor_unix_common::constants::{DEFAULT_CONFIG_PATH, WATCH_FAILURE_EXIT_CODE};
use wolkentor_unix_common::users::ensure::{
    DirectEnsurer, Ensurer, ExecEnsurer, SystemExecutor,
};
use wolkentor_unix_common::users::repository::IdentityRepository;

/// Pass this a file path and it'll look for the file and remove it if it's
/// there.
fn rm_if_exist(p: &str) {
    if Path::new(p).exists() {
        debug!("Removing requested file {:?}", p);
        let _ = std::fs::remove_file(p).map_err(|e| {
            error!("Failure while attempting to remove {:?} -> {:?}", p, e);
        });
    } else {
        debug!("Path {:?} doesn't exist, not attempting to remove.", p);
    }
}

async fn apply_socket_ownership(
    socket_path: &str,
    repository: &Arc<IdentityRepository>,
    owner: Option<&str>,
    group: Option<&str>,
) -> Result<(), String> {
    if owner.is_none() && group.is_none() {
        return Ok(());
    }

    let mut uid = u32::MAX;
    if let Some(owner) = owner {
        uid = match repository.lookup_by_name(owner).await {
            Some(user) => user.uid as u32,
            None => owner
                .parse::<u32>()
                .map_err(|_| format!("cannot resolve socket owner {:?}", owner))?,
        };
    }
    let mut gid = u32::MAX;
    if let Some(group) = group {
        gid = match repository.lookup_group_by_name(group).await {
            Some(g) => g.gid as u32,
            None => group
                .parse::<u32>()
                .map_err(|_| format!("cannot resolve socket group {:?}", group))?,
        };
    }

    let path = CString::new(Path::new(socket_path).as_os_str().as_bytes())
        .map_err(|_| "unable to create c-string".to_string())?;
    if unsafe { libc::chown(path.as_ptr(), uid, gid) } != 0 {
        return Err(format!(
            "cannot change ownership of {}: {}",
            socket_path,
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let clap_args = Command::new("wolkentord")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Wolkentor Trust Broker Daemon")
        .arg(
            Arg::new("debug")
                .help("Show extra debug information")
                .short('d')
                .long("debug")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .help("Path to the configuration file")
                .short('c')
                .long("config")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .get_matches();

    if clap_args.get_flag("debug") {
        std::env::set_var("RUST_LOG", "debug");
    }
    tracing_subscriber::fmt::init();

    let stop_now = Arc::new(AtomicBool::new(false));
    let terminate_now = Arc::clone(&stop_now);
    let quit_now = Arc::clone(&stop_now);
    let interrupt_now = Arc::clone(&stop_now);

    async {
        let config_path = clap_args
            .get_one::<String>("config")
            .map(String::as_str);
        let store = match ConfigurationStore::load(config_path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        };
        if store.keys().is_empty() {
            warn!("no authentication configurations defined; every client will be rejected");
        }

        let global = store.global().clone();
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
                return ExitCode::FAILURE;
            }
        };

        // External changes to the databases trigger async reloads. Once a
        // reload fails the in-memory state can no longer be trusted; the
        // policy here is to leave the rest to a service supervisor.
        let mut watch = match repository.watch() {
            Ok(watch) => watch,
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        };
        tokio::spawn(async move {
            if let Some(e) = watch.errors.recv().await {
                error!(
                    "{}; will exit now and hope for a restart of this service to reset the state (exit code {})",
                    e, WATCH_FAILURE_EXIT_CODE
                );
                std::process::exit(WATCH_FAILURE_EXIT_CODE);
            }
        });

        let ensurer: Arc<dyn Ensurer> = match global.ensure_backend {
            EnsureBackend::Exec => Arc::new(ExecEnsurer::new(
                repository.clone(),
                Arc::new(SystemExecutor),
                global.default_group.clone(),
            )),
            EnsureBackend::Direct => Arc::new(DirectEnsurer::new(
                repository.clone(),
                global.default_group.clone(),
            )),
        };
        let broker = Arc::new(Broker::new(
            store.clone(),
            Arc::new(CoordinatorRunner::new(ensurer)),
        ));

        let socket_path = global.socket_path.clone();
        debug!("🧹 Cleaning up socket from previous invocations");
        rm_if_exist(&socket_path);
        if let Some(parent) = Path::new(&socket_path).parent() {
            if !parent.exists() {
                if let Err(e) = DirBuilder::new().recursive(true).mode(0o755).create(parent) {
                    error!("Failed to create {}: {}", parent.display(), e);
                    return ExitCode::FAILURE;
                }
            }
        }

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind UNIX socket at {}: {}", &socket_path, e);
                return ExitCode::FAILURE;
            }
        };

        // Ownership and permissions are applied after bind, before the
        // first accept.
        if let Err(e) = apply_socket_ownership(
            &socket_path,
            &repository,
            global.socket_owner.as_deref(),
            global.socket_group.as_deref(),
        )
        .await
        {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
        let mode = global.socket_mode.unwrap_or(0o777);
        if let Err(e) = set_permissions(&socket_path, Permissions::from_mode(mode)) {
            error!("Failed to set permissions for {}: {}", &socket_path, e);
            return ExitCode::FAILURE;
        }

        let server = tokio::spawn(async move {
            while !stop_now.load(Ordering::Relaxed) {
                let broker_ref = broker.clone();
                match listener.accept().await {
                    Ok((socket, _addr)) => {
                        tokio::spawn(async move {
                            if let Err(e) = broker_ref.handle_connection(socket).await {
                                error!("handle_connection error occurred; error = {:?}", e);
                            }
                        });
                    }
                    Err(err) => {
                        error!("Error while handling connection -> {:?}", err);
                    }
                }
            }
        });

        let terminate_task = tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    terminate_now.store(true, Ordering::Relaxed);
                }
                Err(e) => {
                    error!("Failed registering terminate signal: {}", e);
                }
            };
        });

        let quit_task = tokio::spawn(async move {
            match signal(SignalKind::quit()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    quit_now.store(true, Ordering::Relaxed);
                }
                Err(e) => {
                    error!("Failed registering quit signal: {}", e);
                }
            };
        });

        let interrupt_task = tokio::spawn(async move {
            match signal(SignalKind::interrupt()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    interrupt_now.store(true, Ordering::Relaxed);
                }
                Err(e) => {
                    error!("Failed registering interrupt signal: {}", e);
                }
            };
        });

        info!("Server started ...");

        tokio::select! {
            _ = server => {
                debug!("Main listener task is terminating");
            },
            _ = terminate_task => {
                debug!("Received signal to terminate");
            },
            _ = quit_task => {
                debug!("Received signal to quit");
            },
            _ = interrupt_task => {
                debug!("Received signal to interrupt");
            }
        }

        ExitCode::SUCCESS
    }
    .await
}
