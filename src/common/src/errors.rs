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
use std::error::Error;
use std::fmt;

/// The coarse classification an error belongs to. The kind drives how a
/// failure is reported over the wire and whether it is treated as an
/// expected outcome (User) or a fault (everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing configuration, unreachable issuer at startup,
    /// invalid regex. Fatal to the run, surfaced verbatim to the operator.
    Configuration,
    /// Transport failures while contacting the identity provider.
    Network,
    /// The human did not act in time. An expected outcome, not logged at
    /// error severity.
    User,
    /// Token verification failures, userinfo rejections.
    Permission,
    /// Local repository I/O, lock acquisition, privileged command failures,
    /// "not found after creation".
    System,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => f.write_str("configuration"),
            ErrorKind::Network => f.write_str("network"),
            ErrorKind::User => f.write_str("user"),
            ErrorKind::Permission => f.write_str("permission"),
            ErrorKind::System => f.write_str("system"),
        }
    }
}

/// An error with its taxonomy kind and the operation context it was raised
/// in. Every layer wraps with the operation and identifying context before
/// returning; callers must only branch on the kind, never on message text.
#[derive(Debug)]
pub struct AuthError {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl AuthError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        AuthError {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        AuthError {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Wrap this error with an outer operation context, keeping the kind.
    pub fn context(self, message: impl Into<String>) -> Self {
        AuthError {
            kind: self.kind,
            message: message.into(),
            source: Some(Box::new(self)),
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => f.write_str(&self.message),
        }
    }
}

impl Error for AuthError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_kind() {
        let err = AuthError::network("cannot reach issuer").context("device auth failed");
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(
            err.to_string(),
            "device auth failed: cannot reach issuer".to_string()
        );
    }

    #[test]
    fn test_with_source_display() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = AuthError::with_source(ErrorKind::System, "cannot open /etc/passwd", io);
        assert_eq!(err.to_string(), "cannot open /etc/passwd: boom".to_string());
    }
}
