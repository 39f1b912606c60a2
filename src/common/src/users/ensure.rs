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

//! Desired-state reconciliation of users and groups.
//!
//! A [Requirement] describes the target identity; the [Ensurer] decides
//! create vs. modify vs. no-op against the repository and issues the
//! corresponding privileged commands. Mutations always go through an
//! external command followed by a fresh lookup; the command's exit code is
//! never trusted as the new state.

use std::fmt;
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;

use crate::constants::DEFAULT_SHELL;
use crate::errors::AuthError;
use crate::users::repository::IdentityRepository;
use crate::users::{Group, GroupId, Id, User};

/// Desired state of a group: gid and/or name, at least one of both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupRequirement {
    pub gid: Option<GroupId>,
    pub name: String,
}

impl GroupRequirement {
    pub fn with_name(name: impl Into<String>) -> Self {
        GroupRequirement {
            gid: None,
            name: name.into(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.gid.is_none() && self.name.is_empty()
    }

    /// The name to address the group by, deriving a synthetic one from the
    /// gid when no name is given.
    pub fn name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match self.gid {
            Some(gid) => format!("group-{}", gid),
            None => String::new(),
        }
    }

    /// Structural satisfaction: every field that is set must match.
    pub fn does_fulfil(&self, group: &Group) -> bool {
        if let Some(gid) = self.gid {
            if gid != group.gid {
                return false;
            }
        }
        if !self.name.is_empty() && self.name != group.name {
            return false;
        }
        true
    }
}

impl fmt::Display for GroupRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.gid, self.name.is_empty()) {
            (Some(gid), false) => write!(f, "{}({})", gid, self.name),
            (Some(gid), true) => write!(f, "{}", gid),
            (None, false) => f.write_str(&self.name),
            (None, true) => f.write_str("<empty>"),
        }
    }
}

/// Desired state of a user. Either name or uid must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub display_name: String,
    pub uid: Option<Id>,
    pub group: GroupRequirement,
    pub groups: Vec<GroupRequirement>,
    pub shell: String,
    pub home_dir: String,
    pub skel: String,
}

impl Requirement {
    /// Applies the defaulting policy used before reconciliation: synthetic
    /// name from the uid, home below `/home`, the configured default group
    /// as primary, the primary as the only secondary, `/bin/sh` as shell.
    pub fn or_defaults(&self, default_group: &str) -> Requirement {
        let mut result = self.clone();
        if result.name.is_empty() {
            if let Some(uid) = result.uid {
                result.name = format!("user-{}", uid);
            }
        }
        if result.home_dir.is_empty() && !result.name.is_empty() {
            result.home_dir = format!("/home/{}", result.name);
        }
        if result.group.is_zero() {
            result.group = GroupRequirement::with_name(default_group);
        }
        if result.groups.is_empty() {
            result.groups = vec![result.group.clone()];
        }
        if !result.groups.contains(&result.group) {
            result.groups.insert(0, result.group.clone());
        }
        if result.shell.is_empty() {
            result.shell = DEFAULT_SHELL.to_string();
        }
        result
    }

    /// The name to address the user by, deriving a synthetic one from the
    /// uid when no name is given.
    pub fn name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match self.uid {
            Some(uid) => format!("user-{}", uid),
            None => String::new(),
        }
    }

    /// Structural satisfaction against an observed user; used to decide
    /// whether reconciliation is a no-op.
    pub fn does_fulfil(&self, user: &User) -> bool {
        if !self.name.is_empty() && self.name != user.name {
            return false;
        }
        if self.display_name != user.display_name {
            return false;
        }
        if let Some(uid) = self.uid {
            if uid != user.uid {
                return false;
            }
        }
        if !self.shell.is_empty() && self.shell != user.shell {
            return false;
        }
        if !self.home_dir.is_empty() && self.home_dir != user.home_dir {
            return false;
        }
        if !self.group.does_fulfil(&user.group) {
            return false;
        }
        if !self.groups.is_empty() {
            if self.groups.len() != user.groups.len() {
                return false;
            }
            for group in &user.groups {
                if !self.groups.iter().any(|req| req.does_fulfil(group)) {
                    return false;
                }
            }
        }
        true
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.uid, self.name.is_empty()) {
            (Some(uid), false) => write!(f, "{}({})", uid, self.name),
            (Some(uid), true) => write!(f, "{}", uid),
            (None, false) => f.write_str(&self.name),
            (None, true) => f.write_str("<empty>"),
        }
    }
}

/// Hints for [Ensurer::ensure]; both flags always carry a concrete value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsureOpts {
    pub create_allowed: bool,
    pub modify_allowed: bool,
}

impl Default for EnsureOpts {
    fn default() -> Self {
        EnsureOpts {
            create_allowed: true,
            modify_allowed: true,
        }
    }
}

/// Failure of an external privileged command, with the exit code and
/// captured stderr.
#[derive(Debug)]
pub struct ExecError {
    pub program: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} failed with exit code {}", self.program, code)?,
            None => write!(f, "{} was terminated by a signal", self.program)?,
        }
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecError {}

/// Capability to run the privileged account-management commands
/// (`useradd`, `usermod`, `groupadd`, `groupmod`, `userdel`, `groupdel`).
pub trait Executor: Send + Sync {
    fn execute(&self, program: &str, args: &[String]) -> Result<(), ExecError>;
}

/// Executor spawning the real system tools.
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn execute(&self, program: &str, args: &[String]) -> Result<(), ExecError> {
        debug!("executing {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| ExecError {
                program: program.to_string(),
                exit_code: None,
                stderr: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ExecError {
                program: program.to_string(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}

/// Ensures that a user or group exists matching the given requirement.
///
/// `Ok(None)` means the entity is absent and creation was not allowed.
#[async_trait]
pub trait Ensurer: Send + Sync {
    async fn ensure(&self, req: &Requirement, opts: EnsureOpts)
        -> Result<Option<User>, AuthError>;

    async fn ensure_group(
        &self,
        req: &GroupRequirement,
        opts: EnsureOpts,
    ) -> Result<Option<Group>, AuthError>;
}

fn check_fits_u32(what: &str, v: u64) -> Result<(), AuthError> {
    u32::try_from(v)
        .map(|_| ())
        .map_err(|_| AuthError::system(format!("{} {} does not fit into 32 bits", what, v)))
}

/// The default [Ensurer]: mutates through the external account-management
/// commands and re-reads ground truth from the repository afterwards.
pub struct ExecEnsurer {
    repository: Arc<IdentityRepository>,
    executor: Arc<dyn Executor>,
    default_group: String,
}

impl ExecEnsurer {
    pub fn new(
        repository: Arc<IdentityRepository>,
        executor: Arc<dyn Executor>,
        default_group: impl Into<String>,
    ) -> Self {
        ExecEnsurer {
            repository,
            executor,
            default_group: default_group.into(),
        }
    }

    async fn lookup_group(&self, req: &GroupRequirement) -> Result<Option<Group>, AuthError> {
        match req.gid {
            Some(gid) => Ok(self.repository.lookup_group_by_gid(gid).await),
            None => Ok(self.repository.lookup_group_by_name(&req.name).await),
        }
    }

    async fn create_group(&self, req: &GroupRequirement) -> Result<Group, AuthError> {
        let name = req.name();
        let mut args = Vec::new();
        if let Some(gid) = req.gid {
            check_fits_u32("GID", gid)?;
            args.push("-g".to_string());
            args.push(gid.to_string());
        }
        args.push(name.clone());

        self.executor.execute("groupadd", &args).map_err(|e| {
            AuthError::with_source(
                crate::errors::ErrorKind::System,
                format!("cannot create group {}", name),
                e,
            )
        })?;

        self.repository.reload().await?;
        match self.repository.lookup_group_by_name(&name).await {
            Some(group) => Ok(group),
            None => Err(AuthError::system(format!(
                "group {} cannot be found after it was created",
                name
            ))),
        }
    }

    async fn modify_group(
        &self,
        req: &GroupRequirement,
        existing: &Group,
    ) -> Result<Group, AuthError> {
        let mut args = Vec::new();
        if !req.name.is_empty() {
            args.push("-n".to_string());
            args.push(req.name.clone());
        }
        if let Some(gid) = req.gid {
            check_fits_u32("GID", gid)?;
            args.push("-g".to_string());
            args.push(gid.to_string());
        }
        args.push(existing.name.clone());

        self.executor.execute("groupmod", &args).map_err(|e| {
            AuthError::with_source(
                crate::errors::ErrorKind::System,
                format!("cannot modify group {}", existing),
                e,
            )
        })?;

        self.repository.reload().await?;
        // Re-lookup by the new identifying attribute.
        let found = if !req.name.is_empty() {
            self.repository.lookup_group_by_name(&req.name).await
        } else {
            match req.gid {
                Some(gid) => self.repository.lookup_group_by_gid(gid).await,
                None => None,
            }
        };
        match found {
            Some(group) => Ok(group),
            None => Err(AuthError::system(format!(
                "group {} cannot be found after it was modified",
                existing
            ))),
        }
    }

    async fn ensure_group_inner(
        &self,
        req: &GroupRequirement,
        opts: EnsureOpts,
    ) -> Result<Option<Group>, AuthError> {
        if req.is_zero() {
            return Err(AuthError::system(
                "group requirement with neither GID nor name",
            ));
        }
        let fail_ctx = |e: AuthError| e.context(format!("cannot ensure group {}", req));

        let existing = self.lookup_group(req).await?;

        let Some(existing) = existing else {
            if !opts.create_allowed {
                return Ok(None);
            }
            return self.create_group(req).await.map(Some).map_err(fail_ctx);
        };

        if req.does_fulfil(&existing) || !opts.modify_allowed {
            return Ok(Some(existing));
        }

        self.modify_group(req, &existing)
            .await
            .map(Some)
            .map_err(fail_ctx)
    }

    fn format_gids(groups: &[Group]) -> String {
        groups
            .iter()
            .map(|g| g.gid.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    async fn create_user(
        &self,
        req: &Requirement,
        group: &Group,
        groups: &[Group],
    ) -> Result<User, AuthError> {
        let name = req.name();
        check_fits_u32("GID", group.gid)?;

        let mut args = Vec::new();
        if let Some(uid) = req.uid {
            check_fits_u32("UID", uid)?;
            args.push("-u".to_string());
            args.push(uid.to_string());
        }
        if !req.home_dir.is_empty() {
            args.push("-d".to_string());
            args.push(req.home_dir.clone());
        }
        if !req.skel.is_empty() {
            args.push("-k".to_string());
            args.push(req.skel.clone());
        }
        args.extend([
            "--badname".to_string(),
            "-m".to_string(),
            "-c".to_string(),
            req.display_name.clone(),
            "-g".to_string(),
            group.gid.to_string(),
            "-G".to_string(),
            Self::format_gids(groups),
            "-s".to_string(),
            req.shell.clone(),
            name.clone(),
        ]);

        self.executor.execute("useradd", &args).map_err(|e| {
            AuthError::with_source(
                crate::errors::ErrorKind::System,
                format!("cannot create user {}", name),
                e,
            )
        })?;

        self.repository.reload().await?;
        match self.repository.lookup_by_name(&name).await {
            Some(user) => Ok(user),
            None => Err(AuthError::system(format!(
                "user {} cannot be found after it was created",
                name
            ))),
        }
    }

    async fn modify_user(
        &self,
        req: &Requirement,
        existing: &User,
        group: &Group,
        groups: &[Group],
    ) -> Result<User, AuthError> {
        check_fits_u32("GID", group.gid)?;

        let mut args = Vec::new();
        if !req.name.is_empty() && req.name != existing.name {
            args.push("-l".to_string());
            args.push(req.name.clone());
        }
        if let Some(uid) = req.uid {
            check_fits_u32("UID", uid)?;
            args.push("-u".to_string());
            args.push(uid.to_string());
        }
        if !req.home_dir.is_empty() && req.home_dir != existing.home_dir {
            args.push("-m".to_string());
            args.push("-d".to_string());
            args.push(req.home_dir.clone());
        }
        args.extend([
            "--badname".to_string(),
            "-c".to_string(),
            req.display_name.clone(),
            "-g".to_string(),
            group.gid.to_string(),
            "-G".to_string(),
            Self::format_gids(groups),
            "-s".to_string(),
            req.shell.clone(),
            existing.name.clone(),
        ]);

        self.executor.execute("usermod", &args).map_err(|e| {
            AuthError::with_source(
                crate::errors::ErrorKind::System,
                format!("cannot modify user {}", existing),
                e,
            )
        })?;

        self.repository.reload().await?;
        // Re-lookup by the new identifying attribute.
        let found = if !req.name.is_empty() {
            self.repository.lookup_by_name(&req.name).await
        } else {
            match req.uid {
                Some(uid) => self.repository.lookup_by_uid(uid).await,
                None => None,
            }
        };
        match found {
            Some(user) => Ok(user),
            None => Err(AuthError::system(format!(
                "user {} cannot be found after it was modified",
                existing
            ))),
        }
    }

    /// Deletes a user via `userdel`; an exit code of 6 (no such user) is
    /// treated as already deleted.
    pub async fn delete_user(&self, name: &str, remove_home: bool) -> Result<(), AuthError> {
        if name.is_empty() {
            return Err(AuthError::system("cannot delete user with empty name"));
        }
        let mut args = vec!["-f".to_string()];
        if remove_home {
            args.push("-r".to_string());
        }
        args.push(name.to_string());
        match self.executor.execute("userdel", &args) {
            Ok(()) => Ok(()),
            Err(e) if e.exit_code == Some(6) => Ok(()),
            Err(e) => Err(AuthError::with_source(
                crate::errors::ErrorKind::System,
                format!("cannot delete user {}", name),
                e,
            )),
        }
    }

    /// Deletes a group via `groupdel`; an exit code of 6 (no such group) is
    /// treated as already deleted.
    pub async fn delete_group(&self, name: &str) -> Result<(), AuthError> {
        if name.is_empty() {
            return Err(AuthError::system("cannot delete group with empty name"));
        }
        let args = vec![name.to_string()];
        match self.executor.execute("groupdel", &args) {
            Ok(()) => Ok(()),
            Err(e) if e.exit_code == Some(6) => Ok(()),
            Err(e) => Err(AuthError::with_source(
                crate::errors::ErrorKind::System,
                format!("cannot delete group {}", name),
                e,
            )),
        }
    }
}

#[async_trait]
impl Ensurer for ExecEnsurer {
    #[instrument(level = "debug", skip_all, fields(user = %req))]
    async fn ensure(
        &self,
        req: &Requirement,
        opts: EnsureOpts,
    ) -> Result<Option<User>, AuthError> {
        let req = req.or_defaults(&self.default_group);
        if req.name.is_empty() && req.uid.is_none() {
            return Err(AuthError::system(
                "user requirement with neither UID nor name",
            ));
        }
        let fail_ctx = |e: AuthError| e.context(format!("cannot ensure user {}", req));

        let mut existing = None;
        if let Some(uid) = req.uid {
            existing = self.repository.lookup_by_uid(uid).await;
        }
        if existing.is_none() && !req.name.is_empty() {
            existing = self.repository.lookup_by_name(&req.name).await;
        }

        // Groups are resolved first; the user commands need concrete gids.
        let Some(group) = self.ensure_group_inner(&req.group, opts).await.map_err(fail_ctx)?
        else {
            return Ok(None);
        };
        let mut groups = Vec::with_capacity(req.groups.len());
        for group_req in &req.groups {
            let Some(g) = self
                .ensure_group_inner(group_req, opts)
                .await
                .map_err(|e| e.context(format!("cannot ensure user {}", req)))?
            else {
                return Ok(None);
            };
            groups.push(g);
        }

        let Some(existing) = existing else {
            if !opts.create_allowed {
                return Ok(None);
            }
            let created = self
                .create_user(&req, &group, &groups)
                .await
                .map_err(|e| e.context(format!("cannot ensure user {}", req)))?;
            info!("user {} created", created);
            return Ok(Some(created));
        };

        if req.does_fulfil(&existing) || !opts.modify_allowed {
            return Ok(Some(existing));
        }

        let modified = self
            .modify_user(&req, &existing, &group, &groups)
            .await
            .map_err(|e| e.context(format!("cannot ensure user {}", req)))?;
        info!("user {} updated", modified);
        Ok(Some(modified))
    }

    #[instrument(level = "debug", skip_all, fields(group = %req))]
    async fn ensure_group(
        &self,
        req: &GroupRequirement,
        opts: EnsureOpts,
    ) -> Result<Option<Group>, AuthError> {
        self.ensure_group_inner(req, opts).await
    }
}

/// [Ensurer] writing the colon databases directly through the repository's
/// transactional ensure-entry operation instead of spawning external tools.
pub struct DirectEnsurer {
    repository: Arc<IdentityRepository>,
    default_group: String,
}

impl DirectEnsurer {
    pub fn new(repository: Arc<IdentityRepository>, default_group: impl Into<String>) -> Self {
        DirectEnsurer {
            repository,
            default_group: default_group.into(),
        }
    }
}

#[async_trait]
impl Ensurer for DirectEnsurer {
    #[instrument(level = "debug", skip_all, fields(user = %req))]
    async fn ensure(
        &self,
        req: &Requirement,
        opts: EnsureOpts,
    ) -> Result<Option<User>, AuthError> {
        let req = req.or_defaults(&self.default_group);
        if req.name.is_empty() && req.uid.is_none() {
            return Err(AuthError::system(
                "user requirement with neither UID nor name",
            ));
        }
        self.repository
            .ensure_entry(&req, opts)
            .await
            .map_err(|e| e.context(format!("cannot ensure user {}", req)))
    }

    #[instrument(level = "debug", skip_all, fields(group = %req))]
    async fn ensure_group(
        &self,
        req: &GroupRequirement,
        opts: EnsureOpts,
    ) -> Result<Option<Group>, AuthError> {
        if req.is_zero() {
            return Err(AuthError::system(
                "group requirement with neither GID nor name",
            ));
        }
        self.repository
            .ensure_group_entry(req, opts)
            .await
            .map_err(|e| e.context(format!("cannot ensure group {}", req)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::users::repository::tests::TempDb;
    use std::sync::Mutex;

    /// Records every command and mimics what the real tools would do to the
    /// temp databases, so the post-mutation re-lookup sees ground truth.
    struct MockExecutor {
        db: TempDb,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl MockExecutor {
        fn new(db: TempDb) -> Self {
            MockExecutor {
                db,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn programs(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(p, _)| p.clone())
                .collect()
        }

        fn flag<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
            args.iter()
                .position(|a| a.as_str() == flag)
                .and_then(|i| args.get(i + 1))
                .map(String::as_str)
        }
    }

    impl Executor for MockExecutor {
        fn execute(&self, program: &str, args: &[String]) -> Result<(), ExecError> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            match program {
                "groupadd" => {
                    let name = args.last().unwrap().clone();
                    let gid = Self::flag(args, "-g")
                        .map(|v| v.parse::<u32>().unwrap())
                        .unwrap_or(1000);
                    self.db.append_group(&name, gid, &[]);
                    Ok(())
                }
                "useradd" => {
                    let name = args.last().unwrap().clone();
                    let uid = Self::flag(args, "-u")
                        .map(|v| v.parse::<u32>().unwrap())
                        .unwrap_or(1000);
                    let gid = Self::flag(args, "-g").unwrap().parse::<u32>().unwrap();
                    let gecos = Self::flag(args, "-c").unwrap_or("");
                    let home = Self::flag(args, "-d").unwrap_or("/home/x");
                    let shell = Self::flag(args, "-s").unwrap_or("/bin/sh");
                    self.db.append_passwd(&name, uid, gid, gecos, home, shell);
                    if let Some(gids) = Self::flag(args, "-G") {
                        for g in gids.split(',').filter(|g| !g.is_empty()) {
                            self.db.add_group_member(g.parse::<u32>().unwrap(), &name);
                        }
                    }
                    Ok(())
                }
                other => Err(ExecError {
                    program: other.to_string(),
                    exit_code: Some(1),
                    stderr: "unexpected command".to_string(),
                }),
            }
        }
    }

    fn requirement(name: &str) -> Requirement {
        Requirement {
            name: name.to_string(),
            display_name: "Alice Example".to_string(),
            group: GroupRequirement::with_name("sso"),
            home_dir: format!("/home/sso/{}", name),
            ..Default::default()
        }
    }

    fn ensurer() -> (ExecEnsurer, Arc<MockExecutor>, Arc<IdentityRepository>) {
        let db = TempDb::create("ensure");
        let repository = Arc::new(db.open());
        let executor = Arc::new(MockExecutor::new(db));
        let ensurer = ExecEnsurer::new(repository.clone(), executor.clone(), "sso");
        (ensurer, executor, repository)
    }

    #[tokio::test]
    async fn test_ensure_creates_group_and_user() {
        let (ensurer, executor, _repo) = ensurer();
        let user = ensurer
            .ensure(&requirement("alice"), EnsureOpts::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.name, "alice".to_string());
        assert_eq!(user.group.name, "sso".to_string());
        assert_eq!(user.shell, "/bin/sh".to_string());
        assert_eq!(
            executor.programs(),
            vec!["groupadd".to_string(), "useradd".to_string()]
        );
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (ensurer, executor, _repo) = ensurer();
        let req = requirement("alice");
        let first = ensurer
            .ensure(&req, EnsureOpts::default())
            .await
            .unwrap()
            .unwrap();
        assert!(req.or_defaults("sso").does_fulfil(&first));

        let before = executor.call_count();
        let second = ensurer
            .ensure(&req, EnsureOpts::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        // The second call must not run any mutating command.
        assert_eq!(executor.call_count(), before);
    }

    #[tokio::test]
    async fn test_ensure_absent_without_create() {
        let (ensurer, executor, _repo) = ensurer();
        let opts = EnsureOpts {
            create_allowed: false,
            modify_allowed: true,
        };
        let result = ensurer.ensure(&requirement("alice"), opts).await.unwrap();
        assert!(result.is_none());
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_ensure_present_without_modify_returns_as_is() {
        let (ensurer, executor, _repo) = ensurer();
        let req = requirement("alice");
        ensurer
            .ensure(&req, EnsureOpts::default())
            .await
            .unwrap()
            .unwrap();
        let before = executor.call_count();

        let mut changed = req.clone();
        changed.display_name = "Somebody Else".to_string();
        let opts = EnsureOpts {
            create_allowed: true,
            modify_allowed: false,
        };
        let user = ensurer.ensure(&changed, opts).await.unwrap().unwrap();
        assert_eq!(user.display_name, "Alice Example".to_string());
        assert_eq!(executor.call_count(), before);
    }

    #[tokio::test]
    async fn test_ensure_group_requires_identity() {
        let (ensurer, _executor, _repo) = ensurer();
        let err = ensurer
            .ensure_group(&GroupRequirement::default(), EnsureOpts::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("neither GID nor name"));
    }

    #[test]
    fn test_group_requirement_synthetic_name() {
        let req = GroupRequirement {
            gid: Some(1523),
            name: String::new(),
        };
        assert_eq!(req.name(), "group-1523".to_string());
    }

    #[test]
    fn test_or_defaults() {
        let req = Requirement {
            uid: Some(1200),
            ..Default::default()
        };
        let defaulted = req.or_defaults("sso");
        assert_eq!(defaulted.name, "user-1200".to_string());
        assert_eq!(defaulted.home_dir, "/home/user-1200".to_string());
        assert_eq!(defaulted.group.name, "sso".to_string());
        assert_eq!(defaulted.groups, vec![defaulted.group.clone()]);
        assert_eq!(defaulted.shell, DEFAULT_SHELL.to_string());
    }

    #[test]
    fn test_does_fulfil_ignores_unset_uid() {
        let user = User {
            name: "alice".to_string(),
            display_name: "Alice".to_string(),
            uid: 1000,
            group: Group {
                gid: 1000,
                name: "sso".to_string(),
            },
            groups: vec![Group {
                gid: 1000,
                name: "sso".to_string(),
            }],
            shell: "/bin/sh".to_string(),
            home_dir: "/home/alice".to_string(),
        };
        let req = Requirement {
            name: "alice".to_string(),
            display_name: "Alice".to_string(),
            group: GroupRequirement::with_name("sso"),
            groups: vec![GroupRequirement::with_name("sso")],
            shell: "/bin/sh".to_string(),
            home_dir: "/home/alice".to_string(),
            ..Default::default()
        };
        assert!(req.does_fulfil(&user));

        let mut with_uid = req.clone();
        with_uid.uid = Some(4711);
        assert!(!with_uid.does_fulfil(&user));
    }
}
