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

//! The trust-broker side of the wire protocol: per-connection handling of
//! one authentication session.
//!
//! One connection carries one header, any number of Log/Info frames, and
//! exactly one terminal result frame. Frames are serialized by a single
//! mutex-guarded writer, so concurrently invoked callbacks cannot
//! interleave partial frames, and nothing is written after the terminal
//! frame.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{Encoder, FramedRead};

use crate::config::{Configuration, ConfigurationStore};
use crate::coordinator::{
    Coordinator, CoordinatorError, EventSink, RunOutcome,
};
use crate::errors::{AuthError, ErrorKind};
use crate::oidc::{DeviceAuthGrant, OidcToken};
use crate::proto::{
    CommandFrame, CommandFrameCodec, CommandHeaderCodec, LogLevel, ProtoError, ResultCode,
    LOG_LEVEL_DEBUG,
};
use crate::users::ensure::Ensurer;
use crate::users::User;

struct SenderInner {
    out: Box<dyn AsyncWrite + Send + Unpin>,
    finished: bool,
}

/// The single writer of one connection. All frames pass through here; the
/// mutex keeps them whole and in FIFO order, and the terminal frame is
/// enforced to be the last one.
pub struct CommandSender {
    inner: Mutex<SenderInner>,
}

impl CommandSender {
    pub fn new(out: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        CommandSender {
            inner: Mutex::new(SenderInner {
                out: Box::new(out),
                finished: false,
            }),
        }
    }

    async fn send(&self, frame: CommandFrame) -> Result<(), ProtoError> {
        let mut inner = self.inner.lock().await;
        if inner.finished {
            return Err(ProtoError::TerminalAlreadySent);
        }
        let terminal = frame.is_terminal();
        let mut buf = BytesMut::new();
        CommandFrameCodec.encode(frame, &mut buf)?;
        inner.out.write_all(&buf).await?;
        inner.out.flush().await?;
        if terminal {
            inner.finished = true;
        }
        Ok(())
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<(), ProtoError> {
        self.send(CommandFrame::Log {
            level,
            message: message.into(),
        })
        .await
    }

    pub async fn info(&self, message: impl Into<String>) -> Result<(), ProtoError> {
        self.send(CommandFrame::Info {
            message: message.into(),
        })
        .await
    }

    pub async fn success_result(&self, user: &User) -> Result<(), ProtoError> {
        self.send(CommandFrame::SuccessResult {
            result: ResultCode::Success,
            local_user: user.name.clone(),
            local_uid: user.uid,
            local_group: user.group.name.clone(),
            local_gid: user.group.gid,
        })
        .await
    }

    pub async fn failed_result(
        &self,
        result: ResultCode,
        message: impl Into<String>,
    ) -> Result<(), ProtoError> {
        self.send(CommandFrame::FailedResult {
            result,
            message: message.into(),
        })
        .await
    }
}

/// [EventSink] translating run milestones into wire frames.
struct WireEventSink {
    sender: Arc<CommandSender>,
}

fn send_err(e: ProtoError) -> AuthError {
    AuthError::with_source(ErrorKind::System, "cannot send frame to client", e)
}

#[async_trait]
impl EventSink for WireEventSink {
    async fn on_device_auth_started(&self, grant: &DeviceAuthGrant) -> Result<(), AuthError> {
        match grant.verification_uri_complete() {
            Some(uri) => {
                self.sender
                    .info(format!(
                        "Open {} in your browser and approve the login request. Waiting for approval...",
                        uri
                    ))
                    .await
                    .map_err(send_err)?;
            }
            None => {
                self.sender
                    .info(format!(
                        "Open {} in your browser and enter the code {}. Waiting for approval...",
                        grant.verification_uri(),
                        grant.user_code()
                    ))
                    .await
                    .map_err(send_err)?;
            }
        }
        self.sender
            .log(LOG_LEVEL_DEBUG, "device authorization flow started")
            .await
            .map_err(send_err)
    }

    async fn on_token_received(&self, _token: &OidcToken) -> Result<(), AuthError> {
        self.sender
            .log(LOG_LEVEL_DEBUG, "token received")
            .await
            .map_err(send_err)
    }

    async fn on_id_token_received(&self, _claims: &Value) -> Result<(), AuthError> {
        self.sender
            .log(LOG_LEVEL_DEBUG, "id token received")
            .await
            .map_err(send_err)
    }

    async fn on_user_info_received(&self, _claims: &Value) -> Result<(), AuthError> {
        self.sender
            .log(LOG_LEVEL_DEBUG, "user info received")
            .await
            .map_err(send_err)
    }
}

/// Runs the authentication flow for one session. Abstracted so the
/// connection handling can be exercised without a live identity provider.
#[async_trait]
pub trait AuthRunner: Send + Sync {
    async fn run(
        &self,
        configuration: Arc<Configuration>,
        requested_username: &str,
        sender: Arc<CommandSender>,
    ) -> Result<RunOutcome, CoordinatorError>;
}

/// The production [AuthRunner]: a [Coordinator] wired to the connection's
/// [CommandSender].
pub struct CoordinatorRunner {
    ensurer: Arc<dyn Ensurer>,
}

impl CoordinatorRunner {
    pub fn new(ensurer: Arc<dyn Ensurer>) -> Self {
        CoordinatorRunner { ensurer }
    }
}

#[async_trait]
impl AuthRunner for CoordinatorRunner {
    async fn run(
        &self,
        configuration: Arc<Configuration>,
        requested_username: &str,
        sender: Arc<CommandSender>,
    ) -> Result<RunOutcome, CoordinatorError> {
        let events = Arc::new(WireEventSink { sender });
        Coordinator::new(configuration, self.ensurer.clone(), events)
            .run(requested_username)
            .await
    }
}

pub struct Broker {
    configurations: Arc<ConfigurationStore>,
    runner: Arc<dyn AuthRunner>,
}

impl Broker {
    pub fn new(configurations: Arc<ConfigurationStore>, runner: Arc<dyn AuthRunner>) -> Self {
        Broker {
            configurations,
            runner,
        }
    }

    /// Handles one accepted connection until its terminal frame.
    ///
    /// A connection that does not open with the protocol marker is closed
    /// without writing anything; this is an expected occurrence, not a
    /// fault. Every other path completes the protocol with exactly one
    /// terminal frame.
    #[instrument(level = "debug", skip_all)]
    pub async fn handle_connection<S>(&self, stream: S) -> Result<(), ProtoError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut header_reader = FramedRead::new(read_half, CommandHeaderCodec);

        let header = match header_reader.next().await {
            Some(Ok(header)) => header,
            Some(Err(ProtoError::NotOurProtocol)) | None => {
                debug!("connection does not meet the protocol; it was rejected");
                return Ok(());
            }
            Some(Err(ProtoError::UnsupportedVersion(version))) => {
                let sender = CommandSender::new(write_half);
                sender
                    .failed_result(
                        ResultCode::SystemErr,
                        format!("client requested unsupported version: {}", version),
                    )
                    .await?;
                return Ok(());
            }
            Some(Err(e)) => return Err(e),
        };

        debug!(
            username = %header.requested_username,
            config = %header.configuration_key,
            client = %header.client_info,
            "client connected"
        );

        let sender = Arc::new(CommandSender::new(write_half));

        let configuration = match header.configuration_key.validate() {
            Ok(()) => self.configurations.get(&header.configuration_key),
            Err(_) => None,
        };
        let Some(configuration) = configuration else {
            sender
                .failed_result(
                    ResultCode::ConfigurationErr,
                    format!(
                        "illegal configuration requested by client: {}",
                        header.configuration_key
                    ),
                )
                .await?;
            return Ok(());
        };

        match self
            .runner
            .run(configuration, &header.requested_username, sender.clone())
            .await
        {
            Ok(RunOutcome::Success(user)) => {
                info!(
                    username = %header.requested_username,
                    client = %header.client_info,
                    "remote user authorized as local user {}",
                    user
                );
                sender.success_result(&user).await?;
            }
            Ok(RunOutcome::Rejected) => {
                sender
                    .failed_result(
                        ResultCode::RequestingNameForbidden,
                        format!(
                            "requesting name {:?} is forbidden by configuration",
                            header.requested_username
                        ),
                    )
                    .await?;
            }
            Err(e) => {
                if e.error.kind() == ErrorKind::User {
                    info!(username = %header.requested_username, "{}", e);
                } else {
                    error!(username = %header.requested_username, "{}", e);
                }
                sender.failed_result(e.result, e.to_string()).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use crate::proto::{CommandHeader, COMMAND_MAGIC_MARKER};
    use crate::users::Group;
    use bytes::BufMut;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockRunner {
        called: AtomicBool,
        outcome: fn() -> Result<RunOutcome, CoordinatorError>,
        send_info: bool,
    }

    #[async_trait]
    impl AuthRunner for MockRunner {
        async fn run(
            &self,
            _configuration: Arc<Configuration>,
            _requested_username: &str,
            sender: Arc<CommandSender>,
        ) -> Result<RunOutcome, CoordinatorError> {
            self.called.store(true, Ordering::Relaxed);
            if self.send_info {
                sender
                    .info("Open https://idp.example.com/device in your browser")
                    .await
                    .unwrap();
            }
            (self.outcome)()
        }
    }

    fn store() -> Arc<ConfigurationStore> {
        Arc::new(
            ConfigurationStore::load_from_str(
                "[default]\noidc_issuer = https://idp.example.com\noidc_client_id = x\n",
            )
            .unwrap(),
        )
    }

    fn sample_user() -> User {
        User {
            name: "alice@example.com".to_string(),
            display_name: "Alice".to_string(),
            uid: 1000,
            group: Group {
                gid: 1000,
                name: "sso".to_string(),
            },
            groups: vec![],
            shell: "/bin/sh".to_string(),
            home_dir: "/home/sso/alice@example.com".to_string(),
        }
    }

    fn broker(
        outcome: fn() -> Result<RunOutcome, CoordinatorError>,
        send_info: bool,
    ) -> (Arc<Broker>, Arc<MockRunner>) {
        let runner = Arc::new(MockRunner {
            called: AtomicBool::new(false),
            outcome,
            send_info,
        });
        (
            Arc::new(Broker::new(store(), runner.clone())),
            runner,
        )
    }

    fn encode_header(username: &str, key: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        CommandHeaderCodec
            .encode(
                CommandHeader {
                    requested_username: username.to_string(),
                    configuration_key: crate::config::ConfigurationKey::raw(key),
                    client_info: "test-client/1".to_string(),
                },
                &mut buf,
            )
            .unwrap();
        buf
    }

    async fn run_session(
        broker: Arc<Broker>,
        payload: &[u8],
    ) -> Vec<CommandFrame> {
        let (mut client, server) = tokio::io::duplex(8192);
        let broker_task = tokio::spawn(async move {
            broker.handle_connection(server).await.unwrap();
        });
        client.write_all(payload).await.unwrap();
        client.shutdown().await.unwrap();
        let mut frames = Vec::new();
        let mut reader = FramedRead::new(client, CommandFrameCodec);
        while let Some(frame) = reader.next().await {
            frames.push(frame.unwrap());
        }
        broker_task.await.unwrap();
        frames
    }

    #[tokio::test]
    async fn test_wrong_magic_writes_nothing() {
        let (broker, runner) = broker(|| Ok(RunOutcome::Rejected), false);
        let frames = run_session(broker, b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(frames.is_empty());
        assert!(!runner.called.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_short_read_writes_nothing() {
        let (broker, runner) = broker(|| Ok(RunOutcome::Rejected), false);
        let frames = run_session(broker, b"EP").await;
        assert!(frames.is_empty());
        assert!(!runner.called.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_unknown_configuration_key() {
        let (broker, runner) = broker(|| Ok(RunOutcome::Rejected), false);
        let frames = run_session(broker, &encode_header("alice", "nope")).await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            CommandFrame::FailedResult {
                result: ResultCode::ConfigurationErr,
                ..
            }
        ));
        // No coordinator gets constructed for an unknown key.
        assert!(!runner.called.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_happy_path_emits_one_success_result() {
        let (broker, runner) = broker(|| Ok(RunOutcome::Success(sample_user())), true);
        let frames = run_session(broker, &encode_header("alice", "default")).await;
        assert!(runner.called.load(Ordering::Relaxed));
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], CommandFrame::Info { .. }));
        match &frames[1] {
            CommandFrame::SuccessResult {
                result,
                local_user,
                local_uid,
                local_group,
                local_gid,
            } => {
                assert!(result.is_success());
                assert_eq!(local_user, &"alice@example.com".to_string());
                assert_eq!(*local_uid, 1000);
                assert_eq!(local_group, &"sso".to_string());
                assert_eq!(*local_gid, 1000);
            }
            other => panic!("expected a success result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_reports_requesting_name_forbidden() {
        let (broker, _runner) = broker(|| Ok(RunOutcome::Rejected), false);
        let frames = run_session(broker, &encode_header("root", "default")).await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            CommandFrame::FailedResult {
                result: ResultCode::RequestingNameForbidden,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_run_reports_its_result_code() {
        let (broker, _runner) = broker(
            || {
                Err(CoordinatorError {
                    result: ResultCode::OidcAuthorizeTimeout,
                    error: AuthError::user("authorize of device timed out"),
                })
            },
            false,
        );
        let frames = run_session(broker, &encode_header("alice", "default")).await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            CommandFrame::FailedResult {
                result: ResultCode::OidcAuthorizeTimeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_a_hard_error() {
        let (broker, runner) = broker(|| Ok(RunOutcome::Rejected), false);
        let mut payload = BytesMut::new();
        payload.put_slice(COMMAND_MAGIC_MARKER);
        payload.put_u16(99);
        let frames = run_session(broker, &payload).await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            CommandFrame::FailedResult {
                result: ResultCode::SystemErr,
                ..
            }
        ));
        assert!(!runner.called.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_sender_refuses_frames_after_terminal() {
        let (client, server) = tokio::io::duplex(1024);
        let sender = CommandSender::new(server);
        sender.info("hello").await.unwrap();
        sender.failed_result(ResultCode::Ignore, "done").await.unwrap();
        let err = sender.info("too late").await.unwrap_err();
        assert!(matches!(err, ProtoError::TerminalAlreadySent));
        drop(client);
    }
}
