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

//! Unprivileged client side of the broker protocol.

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::ConfigurationKey;
use crate::errors::{AuthError, ErrorKind};
use crate::proto::{
    CommandFrame, CommandFrameCodec, CommandHeader, CommandHeaderCodec, LogLevel, ResultCode,
};

/// The terminal outcome of one broker session.
#[derive(Debug)]
pub enum SessionOutcome {
    Success {
        result: ResultCode,
        local_user: String,
        local_uid: u64,
        local_group: String,
        local_gid: u64,
    },
    Failed {
        result: ResultCode,
        message: String,
    },
}

impl SessionOutcome {
    pub fn result(&self) -> ResultCode {
        match self {
            SessionOutcome::Success { result, .. } => *result,
            SessionOutcome::Failed { result, .. } => *result,
        }
    }
}

pub struct BrokerClient {
    stream: UnixStream,
}

impl BrokerClient {
    pub async fn connect(socket_path: &str) -> Result<Self, AuthError> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            AuthError::with_source(
                ErrorKind::System,
                format!("cannot connect to broker socket {}", socket_path),
                e,
            )
        })?;
        Ok(BrokerClient { stream })
    }

    /// Requests authentication of `requested_username` against the named
    /// configuration, forwarding Info and Log frames to the given
    /// callbacks as they arrive, until the terminal frame.
    pub async fn authenticate<FI, FL>(
        self,
        requested_username: &str,
        configuration_key: &ConfigurationKey,
        client_info: &str,
        mut on_info: FI,
        mut on_log: FL,
    ) -> Result<SessionOutcome, AuthError>
    where
        FI: FnMut(&str),
        FL: FnMut(LogLevel, &str),
    {
        let (read_half, write_half) = self.stream.into_split();

        let mut header_writer = FramedWrite::new(write_half, CommandHeaderCodec);
        header_writer
            .send(CommandHeader {
                requested_username: requested_username.to_string(),
                configuration_key: configuration_key.clone(),
                client_info: client_info.to_string(),
            })
            .await
            .map_err(|e| {
                AuthError::with_source(ErrorKind::System, "cannot send command header", e)
            })?;

        let mut frames = FramedRead::new(read_half, CommandFrameCodec);
        while let Some(frame) = frames.next().await {
            let frame = frame.map_err(|e| {
                AuthError::with_source(ErrorKind::System, "cannot decode frame from broker", e)
            })?;
            match frame {
                CommandFrame::Log { level, message } => on_log(level, &message),
                CommandFrame::Info { message } => on_info(&message),
                CommandFrame::SuccessResult {
                    result,
                    local_user,
                    local_uid,
                    local_group,
                    local_gid,
                } => {
                    return Ok(SessionOutcome::Success {
                        result,
                        local_user,
                        local_uid,
                        local_group,
                        local_gid,
                    })
                }
                CommandFrame::FailedResult { result, message } => {
                    return Ok(SessionOutcome::Failed { result, message })
                }
            }
        }

        Err(AuthError::system(
            "broker closed the connection before sending a result",
        ))
    }
}
