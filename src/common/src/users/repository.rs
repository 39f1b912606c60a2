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

//! Single point of truth for the three colon databases.
//!
//! Reads take a shared advisory lock per file; writes take exclusive locks
//! on all three files together and fully rewrite them, so the
//! encode/validate pass stays authoritative. An in-memory snapshot serves
//! lookups and is refreshed when a file watcher observes external changes.
//! Watch failures are posted to a channel; the owning component decides
//! whether to terminate the process.

use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use notify_debouncer_full::notify::event::ModifyKind;
use notify_debouncer_full::notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::sync::{mpsc, RwLock};

use crate::constants::DEFAULT_FS_SYNC_THRESHOLD;
use crate::errors::{AuthError, ErrorKind};
use crate::users::codec::{
    EtcColonFile, EtcGroupEntry, EtcPasswdEntry, EtcShadowEntry,
};
use crate::users::ensure::{EnsureOpts, GroupRequirement, Requirement};
use crate::users::{Group, GroupId, Id, User};

/// The uid/gid reserved for nobody/nogroup; never handed out.
const NOBODY_ID: u32 = 65534;
const MIN_ALLOCATED_ID: u32 = 1000;

#[derive(Debug, Clone, Default)]
struct DbSnapshot {
    passwd: EtcColonFile<EtcPasswdEntry>,
    group: EtcColonFile<EtcGroupEntry>,
    shadow: EtcColonFile<EtcShadowEntry>,
}

/// A failure observed by the asynchronous file watcher. Once one of these
/// is delivered the in-memory state can no longer be trusted to match disk.
#[derive(Debug)]
pub enum WatchError {
    /// A watched file was removed or renamed; both are unsupported.
    Unsupported { file: String, detail: String },
    /// The watcher backend itself failed.
    Notify(String),
    /// Reloading after an observed change failed.
    Reload(AuthError),
}

impl fmt::Display for WatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchError::Unsupported { file, detail } => {
                write!(f, "unsupported change to {}: {}", file, detail)
            }
            WatchError::Notify(msg) => write!(f, "file watcher failed: {}", msg),
            WatchError::Reload(e) => write!(f, "cannot reload repository: {}", e),
        }
    }
}

/// Handle of a running watch; dropping it stops the watcher.
pub struct RepositoryWatch {
    pub errors: mpsc::Receiver<WatchError>,
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for RepositoryWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum WatchSignal {
    Reload,
    Error(WatchError),
}

fn open_locked(path: &Path, write: bool) -> io::Result<File> {
    let file = OpenOptions::new().read(true).write(write).open(path)?;
    let op = if write { libc::LOCK_EX } else { libc::LOCK_SH };
    if unsafe { libc::flock(file.as_raw_fd(), op) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(file)
}

fn io_err(op: &str, path: &Path, e: io::Error) -> AuthError {
    AuthError::with_source(
        ErrorKind::System,
        format!("cannot {} {}", op, path.display()),
        e,
    )
}

pub struct IdentityRepository {
    passwd_path: PathBuf,
    group_path: PathBuf,
    shadow_path: PathBuf,
    allow_bad_name: bool,
    allow_bad_line: bool,
    state: RwLock<DbSnapshot>,
}

impl IdentityRepository {
    pub fn open(
        passwd_path: impl Into<PathBuf>,
        group_path: impl Into<PathBuf>,
        shadow_path: impl Into<PathBuf>,
        allow_bad_name: bool,
        allow_bad_line: bool,
    ) -> Result<Self, AuthError> {
        let mut repository = IdentityRepository {
            passwd_path: passwd_path.into(),
            group_path: group_path.into(),
            shadow_path: shadow_path.into(),
            allow_bad_name,
            allow_bad_line,
            state: RwLock::new(DbSnapshot::default()),
        };
        let snapshot = repository.load_snapshot()?;
        repository.state = RwLock::new(snapshot);
        Ok(repository)
    }

    fn read_file<T: crate::users::codec::EtcColonEntry>(
        &self,
        path: &Path,
    ) -> Result<EtcColonFile<T>, AuthError> {
        let mut file = open_locked(path, false).map_err(|e| io_err("open", path, e))?;
        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| io_err("read", path, e))?;
        EtcColonFile::decode_str(
            &content,
            self.allow_bad_name,
            self.allow_bad_line,
            &path.display().to_string(),
        )
        .map_err(|e| AuthError::with_source(ErrorKind::System, "cannot decode database", e))
    }

    fn load_snapshot(&self) -> Result<DbSnapshot, AuthError> {
        Ok(DbSnapshot {
            passwd: self.read_file(&self.passwd_path)?,
            group: self.read_file(&self.group_path)?,
            shadow: self.read_file(&self.shadow_path)?,
        })
    }

    /// Fully rewrites all three files as a unit, under exclusive locks on
    /// all of them.
    fn save_snapshot(&self, snapshot: &DbSnapshot) -> Result<(), AuthError> {
        let mut passwd =
            open_locked(&self.passwd_path, true).map_err(|e| io_err("open", &self.passwd_path, e))?;
        let mut group =
            open_locked(&self.group_path, true).map_err(|e| io_err("open", &self.group_path, e))?;
        let mut shadow =
            open_locked(&self.shadow_path, true).map_err(|e| io_err("open", &self.shadow_path, e))?;

        let encode_err =
            |e| AuthError::with_source(ErrorKind::System, "cannot encode database", e);
        let contents = [
            (
                &mut passwd,
                &self.passwd_path,
                snapshot.passwd.encode_to_string(self.allow_bad_name).map_err(encode_err)?,
            ),
            (
                &mut group,
                &self.group_path,
                snapshot.group.encode_to_string(self.allow_bad_name).map_err(encode_err)?,
            ),
            (
                &mut shadow,
                &self.shadow_path,
                snapshot.shadow.encode_to_string(self.allow_bad_name).map_err(encode_err)?,
            ),
        ];
        for (file, path, content) in contents {
            file.set_len(0).map_err(|e| io_err("truncate", path, e))?;
            file.seek(SeekFrom::Start(0))
                .map_err(|e| io_err("seek", path, e))?;
            file.write_all(content.as_bytes())
                .map_err(|e| io_err("write", path, e))?;
            file.flush().map_err(|e| io_err("flush", path, e))?;
        }
        Ok(())
    }

    /// Re-reads all three files from disk into the in-memory snapshot.
    #[instrument(level = "debug", skip_all)]
    pub async fn reload(&self) -> Result<(), AuthError> {
        let snapshot = self.load_snapshot()?;
        *self.state.write().await = snapshot;
        debug!("repository reloaded");
        Ok(())
    }

    fn build_user(snapshot: &DbSnapshot, entry: &EtcPasswdEntry) -> User {
        let group = snapshot
            .group
            .entries()
            .find(|g| g.gid == entry.gid)
            .map(|g| Group {
                gid: g.gid as GroupId,
                name: g.name.clone(),
            })
            .unwrap_or_else(|| Group {
                gid: entry.gid as GroupId,
                name: format!("group-{}", entry.gid),
            });
        let groups = snapshot
            .group
            .entries()
            .filter(|g| g.user_names.iter().any(|n| n == &entry.name))
            .map(|g| Group {
                gid: g.gid as GroupId,
                name: g.name.clone(),
            })
            .collect();
        User {
            name: entry.name.clone(),
            display_name: entry.gecos.clone(),
            uid: entry.uid as Id,
            group,
            groups,
            shell: entry.shell.clone(),
            home_dir: entry.home_dir.clone(),
        }
    }

    pub async fn lookup_by_name(&self, name: &str) -> Option<User> {
        if name.is_empty() {
            return None;
        }
        let state = self.state.read().await;
        let result = state
            .passwd
            .entries()
            .find(|e| e.name == name)
            .map(|e| Self::build_user(&state, e));
        result
    }

    pub async fn lookup_by_uid(&self, uid: Id) -> Option<User> {
        let state = self.state.read().await;
        let result = state
            .passwd
            .entries()
            .find(|e| e.uid as Id == uid)
            .map(|e| Self::build_user(&state, e));
        result
    }

    pub async fn lookup_group_by_name(&self, name: &str) -> Option<Group> {
        if name.is_empty() {
            return None;
        }
        let state = self.state.read().await;
        let result = state.group.entries().find(|g| g.name == name).map(|g| Group {
            gid: g.gid as GroupId,
            name: g.name.clone(),
        });
        result
    }

    pub async fn lookup_group_by_gid(&self, gid: GroupId) -> Option<Group> {
        let state = self.state.read().await;
        let result = state
            .group
            .entries()
            .find(|g| g.gid as GroupId == gid)
            .map(|g| Group {
                gid: g.gid as GroupId,
                name: g.name.clone(),
            });
        result
    }

    fn next_free_gid(snapshot: &DbSnapshot) -> u32 {
        let mut highest = 0;
        for g in snapshot.group.entries() {
            if g.gid == NOBODY_ID && g.name == "nogroup" {
                continue;
            }
            highest = highest.max(g.gid);
        }
        let mut next = (highest + 1).max(MIN_ALLOCATED_ID);
        if next == NOBODY_ID {
            next += 1;
        }
        next
    }

    fn next_free_uid(snapshot: &DbSnapshot) -> u32 {
        let mut highest = 0;
        for u in snapshot.passwd.entries() {
            if u.uid == NOBODY_ID && u.name == "nobody" {
                continue;
            }
            highest = highest.max(u.uid);
        }
        let mut next = (highest + 1).max(MIN_ALLOCATED_ID);
        if next == NOBODY_ID {
            next += 1;
        }
        next
    }

    fn gid_for(req_gid: Option<GroupId>, snapshot: &DbSnapshot) -> Result<u32, AuthError> {
        match req_gid {
            Some(gid) => u32::try_from(gid)
                .map_err(|_| AuthError::system(format!("GID {} does not fit into 32 bits", gid))),
            None => Ok(Self::next_free_gid(snapshot)),
        }
    }

    fn ensure_group_in(
        snapshot: &mut DbSnapshot,
        req: &GroupRequirement,
        opts: EnsureOpts,
    ) -> Result<(Option<Group>, bool), AuthError> {
        let existing_idx = match req.gid {
            Some(gid) => snapshot
                .group
                .records
                .iter()
                .position(|r| r.entry().map(|g| g.gid as GroupId == gid).unwrap_or(false)),
            None => snapshot
                .group
                .records
                .iter()
                .position(|r| r.entry().map(|g| g.name == req.name).unwrap_or(false)),
        };

        let Some(existing_idx) = existing_idx else {
            if !opts.create_allowed {
                return Ok((None, false));
            }
            let gid = Self::gid_for(req.gid, snapshot)?;
            let entry = EtcGroupEntry {
                name: req.name(),
                password: "x".to_string(),
                gid,
                user_names: Vec::new(),
            };
            let group = Group {
                gid: gid as GroupId,
                name: entry.name.clone(),
            };
            snapshot.group.push(entry);
            info!("group {} created", group);
            return Ok((Some(group), true));
        };

        let current = match snapshot.group.records[existing_idx].entry() {
            Some(g) => Group {
                gid: g.gid as GroupId,
                name: g.name.clone(),
            },
            None => return Err(AuthError::system("illegal group record state")),
        };
        if req.does_fulfil(&current) || !opts.modify_allowed {
            return Ok((Some(current), false));
        }

        let Some(existing) = snapshot.group.records[existing_idx].entry_mut() else {
            return Err(AuthError::system("illegal group record state"));
        };
        if let Some(gid) = req.gid {
            existing.gid = u32::try_from(gid)
                .map_err(|_| AuthError::system(format!("GID {} does not fit into 32 bits", gid)))?;
        }
        if !req.name.is_empty() {
            existing.name = req.name.clone();
        }
        let modified = Group {
            gid: existing.gid as GroupId,
            name: existing.name.clone(),
        };
        info!("group {} updated", modified);
        Ok((Some(modified), true))
    }

    /// Transactional ensure-entry for a group, writing the databases
    /// directly instead of going through external commands.
    #[instrument(level = "debug", skip_all)]
    pub async fn ensure_group_entry(
        &self,
        req: &GroupRequirement,
        opts: EnsureOpts,
    ) -> Result<Option<Group>, AuthError> {
        let mut state = self.state.write().await;
        *state = self.load_snapshot()?;

        let (group, dirty) = Self::ensure_group_in(&mut state, req, opts)?;
        if dirty {
            self.save_snapshot(&state)?;
        }
        Ok(group)
    }

    /// Transactional ensure-entry for a user. Groups are resolved first;
    /// creating a user touches passwd, group and shadow, which are then
    /// rewritten together.
    #[instrument(level = "debug", skip_all)]
    pub async fn ensure_entry(
        &self,
        req: &Requirement,
        opts: EnsureOpts,
    ) -> Result<Option<User>, AuthError> {
        let mut state = self.state.write().await;
        *state = self.load_snapshot()?;
        let mut dirty = false;

        let (group, group_dirty) = Self::ensure_group_in(&mut state, &req.group, opts)?;
        dirty |= group_dirty;
        let Some(group) = group else {
            if dirty {
                self.save_snapshot(&state)?;
            }
            return Ok(None);
        };
        let mut groups = Vec::with_capacity(req.groups.len());
        for group_req in &req.groups {
            let (g, g_dirty) = Self::ensure_group_in(&mut state, group_req, opts)?;
            dirty |= g_dirty;
            let Some(g) = g else {
                if dirty {
                    self.save_snapshot(&state)?;
                }
                return Ok(None);
            };
            groups.push(g);
        }

        let mut existing_idx = None;
        if let Some(uid) = req.uid {
            existing_idx = state
                .passwd
                .records
                .iter()
                .position(|r| r.entry().map(|e| e.uid as Id == uid).unwrap_or(false));
        }
        if existing_idx.is_none() && !req.name.is_empty() {
            existing_idx = state
                .passwd
                .records
                .iter()
                .position(|r| r.entry().map(|e| e.name == req.name).unwrap_or(false));
        }

        let Some(existing_idx) = existing_idx else {
            if !opts.create_allowed {
                if dirty {
                    self.save_snapshot(&state)?;
                }
                return Ok(None);
            }
            let uid = match req.uid {
                Some(uid) => u32::try_from(uid).map_err(|_| {
                    AuthError::system(format!("UID {} does not fit into 32 bits", uid))
                })?,
                None => Self::next_free_uid(&state),
            };
            let gid = u32::try_from(group.gid)
                .map_err(|_| AuthError::system(format!("GID {} does not fit into 32 bits", group.gid)))?;
            let name = req.name();
            state.passwd.push(EtcPasswdEntry {
                name: name.clone(),
                password: "x".to_string(),
                uid,
                gid,
                gecos: req.display_name.clone(),
                home_dir: req.home_dir.clone(),
                shell: req.shell.clone(),
            });
            state.shadow.push(EtcShadowEntry {
                name: name.clone(),
                password: "*".to_string(),
                last_changed_at_days: today_in_days(),
                minimum_age_days: 0,
                maximum_age_days: 99999,
                warn_age_days: 7,
                has_warn_age: true,
                inactive_age_days: 0,
                has_inactive_age: false,
                expire_at_days: 0,
                has_expire: false,
            });
            for g in &groups {
                if let Some(entry) = state
                    .group
                    .entries_mut()
                    .find(|e| e.gid as GroupId == g.gid)
                {
                    entry.add_unique_user_name(&name);
                }
            }
            self.save_snapshot(&state)?;
            let user = state
                .passwd
                .entries()
                .find(|e| e.name == name)
                .map(|e| Self::build_user(&state, e));
            let Some(user) = user else {
                return Err(AuthError::system(format!(
                    "user {} cannot be found after it was created",
                    name
                )));
            };
            info!("user {} created", user);
            return Ok(Some(user));
        };

        let existing_entry = match state.passwd.records[existing_idx].entry() {
            Some(e) => e.clone(),
            None => return Err(AuthError::system("illegal passwd record state")),
        };
        let existing_user = Self::build_user(&state, &existing_entry);

        if req.does_fulfil(&existing_user) || !opts.modify_allowed {
            if dirty {
                self.save_snapshot(&state)?;
            }
            return Ok(Some(existing_user));
        }

        let old_name = existing_user.name.clone();
        let gid = u32::try_from(group.gid)
            .map_err(|_| AuthError::system(format!("GID {} does not fit into 32 bits", group.gid)))?;
        let new_name = if req.name.is_empty() {
            old_name.clone()
        } else {
            req.name.clone()
        };
        if let Some(entry) = state.passwd.records[existing_idx].entry_mut() {
            if let Some(uid) = req.uid {
                entry.uid = u32::try_from(uid).map_err(|_| {
                    AuthError::system(format!("UID {} does not fit into 32 bits", uid))
                })?;
            }
            entry.name = new_name.clone();
            entry.gid = gid;
            entry.gecos = req.display_name.clone();
            entry.home_dir = req.home_dir.clone();
            entry.shell = req.shell.clone();
        }
        for entry in state.shadow.entries_mut() {
            if entry.name == old_name {
                entry.name = new_name.clone();
            }
        }
        for entry in state.group.entries_mut() {
            entry.remove_user_name(&old_name);
        }
        for g in &groups {
            if let Some(entry) = state
                .group
                .entries_mut()
                .find(|e| e.gid as GroupId == g.gid)
            {
                entry.add_unique_user_name(&new_name);
            }
        }
        self.save_snapshot(&state)?;
        let user = state
            .passwd
            .entries()
            .find(|e| e.name == new_name)
            .map(|e| Self::build_user(&state, e));
        match user {
            Some(user) => {
                info!("user {} updated", user);
                Ok(Some(user))
            }
            None => Err(AuthError::system(format!(
                "user {} cannot be found after it was modified",
                old_name
            ))),
        }
    }

    /// Starts watching the database files for external modifications.
    /// Changes trigger a debounced reload; failures (including unsupported
    /// remove/rename events) are posted to the returned error channel. The
    /// caller decides the failure policy; the watcher never exits the
    /// process itself.
    pub fn watch(self: &Arc<Self>) -> Result<RepositoryWatch, AuthError> {
        let files: HashSet<PathBuf> = [&self.passwd_path, &self.group_path, &self.shadow_path]
            .into_iter()
            .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
            .collect();
        let directories: HashSet<PathBuf> = files
            .iter()
            .filter_map(|p| p.parent().map(Path::to_path_buf))
            .collect();

        let (signal_tx, mut signal_rx) = mpsc::channel::<WatchSignal>(8);
        let handler_files = files.clone();
        let mut debouncer = new_debouncer(
            DEFAULT_FS_SYNC_THRESHOLD,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let mut relevant = false;
                    let mut unsupported = None;
                    for event in &events {
                        let Some(path) = event
                            .paths
                            .iter()
                            .find(|p| handler_files.contains(p.as_path()))
                        else {
                            continue;
                        };
                        relevant = true;
                        match event.kind {
                            EventKind::Remove(_) => {
                                unsupported = Some(WatchError::Unsupported {
                                    file: path.display().to_string(),
                                    detail: "file was removed".to_string(),
                                });
                            }
                            EventKind::Modify(ModifyKind::Name(_)) => {
                                unsupported = Some(WatchError::Unsupported {
                                    file: path.display().to_string(),
                                    detail: "file was renamed".to_string(),
                                });
                            }
                            _ => {}
                        }
                    }
                    if let Some(err) = unsupported {
                        let _ = signal_tx.blocking_send(WatchSignal::Error(err));
                    } else if relevant {
                        let _ = signal_tx.blocking_send(WatchSignal::Reload);
                    }
                }
                Err(errors) => {
                    let detail = errors
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    let _ = signal_tx.blocking_send(WatchSignal::Error(WatchError::Notify(detail)));
                }
            },
        )
        .map_err(|e| {
            AuthError::with_source(ErrorKind::System, "cannot initialize file watcher", e)
        })?;

        for directory in &directories {
            debug!("watching changes within directory {}", directory.display());
            debouncer
                .watch(directory, RecursiveMode::NonRecursive)
                .map_err(|e| {
                    AuthError::with_source(
                        ErrorKind::System,
                        format!("cannot watch {}", directory.display()),
                        e,
                    )
                })?;
        }

        let (error_tx, error_rx) = mpsc::channel::<WatchError>(8);
        let repository = self.clone();
        let task = tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                match signal {
                    WatchSignal::Reload => {
                        if let Err(e) = repository.reload().await {
                            if error_tx.send(WatchError::Reload(e)).await.is_err() {
                                return;
                            }
                        }
                    }
                    WatchSignal::Error(e) => {
                        if error_tx.send(e).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(RepositoryWatch {
            errors: error_rx,
            _debouncer: debouncer,
            task,
        })
    }
}

fn today_in_days() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (secs / 60 / 60 / 24) as u32
}

#[cfg(test)]
pub mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    /// A disposable set of passwd/group/shadow files below the system temp
    /// directory, seeded with a root entry.
    pub struct TempDb {
        pub dir: PathBuf,
        pub passwd: PathBuf,
        pub group: PathBuf,
        pub shadow: PathBuf,
    }

    impl TempDb {
        pub fn create(tag: &str) -> Self {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let dir = std::env::temp_dir().join(format!(
                "wolkentor-test-{}-{}-{}",
                tag,
                std::process::id(),
                n
            ));
            fs::create_dir_all(&dir).unwrap();
            let passwd = dir.join("passwd");
            let group = dir.join("group");
            let shadow = dir.join("shadow");
            fs::write(&passwd, "root:x:0:0:root:/root:/bin/bash\n").unwrap();
            fs::write(&group, "root:x:0:\n").unwrap();
            fs::write(&shadow, "root:*:19000:0:99999:7:::\n").unwrap();
            TempDb {
                dir,
                passwd,
                group,
                shadow,
            }
        }

        pub fn open(&self) -> IdentityRepository {
            IdentityRepository::open(&self.passwd, &self.group, &self.shadow, true, true).unwrap()
        }

        pub fn append_passwd(
            &self,
            name: &str,
            uid: u32,
            gid: u32,
            gecos: &str,
            home: &str,
            shell: &str,
        ) {
            let mut content = fs::read_to_string(&self.passwd).unwrap();
            content.push_str(&format!(
                "{}:x:{}:{}:{}:{}:{}\n",
                name, uid, gid, gecos, home, shell
            ));
            fs::write(&self.passwd, content).unwrap();
        }

        pub fn append_group(&self, name: &str, gid: u32, members: &[&str]) {
            let mut content = fs::read_to_string(&self.group).unwrap();
            content.push_str(&format!("{}:x:{}:{}\n", name, gid, members.join(",")));
            fs::write(&self.group, content).unwrap();
        }

        pub fn add_group_member(&self, gid: u32, name: &str) {
            let content = fs::read_to_string(&self.group).unwrap();
            let mut out = String::new();
            for line in content.lines() {
                let fields: Vec<&str> = line.split(':').collect();
                if fields.len() == 4 && fields[2] == gid.to_string() {
                    let mut members: Vec<&str> =
                        fields[3].split(',').filter(|m| !m.is_empty()).collect();
                    if !members.contains(&name) {
                        members.push(name);
                    }
                    out.push_str(&format!(
                        "{}:{}:{}:{}\n",
                        fields[0],
                        fields[1],
                        fields[2],
                        members.join(",")
                    ));
                } else {
                    out.push_str(line);
                    out.push('\n');
                }
            }
            fs::write(&self.group, out).unwrap();
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn sample_db() -> TempDb {
        let db = TempDb::create("repository");
        db.append_group("sso", 1000, &["alice"]);
        db.append_group("wheel", 998, &["alice", "bob"]);
        db.append_passwd(
            "alice",
            1000,
            1000,
            "Alice Example",
            "/home/alice",
            "/bin/bash",
        );
        db
    }

    #[tokio::test]
    async fn test_lookup_by_name_and_uid() {
        let db = sample_db();
        let repository = db.open();

        let by_name = repository.lookup_by_name("alice").await.unwrap();
        assert_eq!(by_name.uid, 1000);
        assert_eq!(by_name.group.name, "sso".to_string());
        assert_eq!(by_name.groups.len(), 2);

        let by_uid = repository.lookup_by_uid(1000).await.unwrap();
        assert_eq!(by_uid, by_name);

        assert!(repository.lookup_by_name("nope").await.is_none());
        assert!(repository.lookup_by_uid(4711).await.is_none());
    }

    #[tokio::test]
    async fn test_lookup_group() {
        let db = sample_db();
        let repository = db.open();

        let by_name = repository.lookup_group_by_name("wheel").await.unwrap();
        assert_eq!(by_name.gid, 998);
        let by_gid = repository.lookup_group_by_gid(998).await.unwrap();
        assert_eq!(by_gid, by_name);
        assert!(repository.lookup_group_by_name("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_reload_sees_external_changes() {
        let db = sample_db();
        let repository = db.open();
        assert!(repository.lookup_by_name("bob").await.is_none());

        db.append_passwd("bob", 1001, 1000, "Bob", "/home/bob", "/bin/sh");
        assert!(repository.lookup_by_name("bob").await.is_none());
        repository.reload().await.unwrap();
        assert!(repository.lookup_by_name("bob").await.is_some());
    }

    #[tokio::test]
    async fn test_bad_lines_are_preserved_on_rewrite() {
        let db = sample_db();
        let mut content = fs::read_to_string(&db.passwd).unwrap();
        content.push_str("# a comment nobody expects here\n");
        fs::write(&db.passwd, content).unwrap();

        let repository = db.open();
        let req = GroupRequirement::with_name("extra");
        repository
            .ensure_group_entry(&req, EnsureOpts::default())
            .await
            .unwrap()
            .unwrap();

        let after = fs::read_to_string(&db.passwd).unwrap();
        assert!(after.contains("# a comment nobody expects here"));
    }

    #[tokio::test]
    async fn test_ensure_group_entry_allocates_gid() {
        let db = sample_db();
        let repository = db.open();

        let req = GroupRequirement::with_name("fresh");
        let group = repository
            .ensure_group_entry(&req, EnsureOpts::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.name, "fresh".to_string());
        assert_eq!(group.gid, 1001);

        // Second call is a no-op.
        let again = repository
            .ensure_group_entry(&req, EnsureOpts::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again, group);
    }

    #[tokio::test]
    async fn test_ensure_entry_creates_user_with_shadow_row() {
        let db = sample_db();
        let repository = db.open();

        let req = Requirement {
            name: "carol".to_string(),
            display_name: "Carol".to_string(),
            group: GroupRequirement::with_name("sso"),
            groups: vec![GroupRequirement::with_name("sso")],
            shell: "/bin/sh".to_string(),
            home_dir: "/home/carol".to_string(),
            ..Default::default()
        };
        let user = repository
            .ensure_entry(&req, EnsureOpts::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.name, "carol".to_string());
        assert_eq!(user.uid, 1001);
        assert_eq!(user.group.name, "sso".to_string());

        let shadow = fs::read_to_string(&db.shadow).unwrap();
        assert!(shadow.lines().any(|l| l.starts_with("carol:*:")));
        let group = fs::read_to_string(&db.group).unwrap();
        assert!(group.lines().any(|l| l.starts_with("sso:") && l.contains("carol")));

        // Idempotent: the second ensure returns the same user.
        let again = repository
            .ensure_entry(&req, EnsureOpts::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again, user);
        assert!(req.does_fulfil(&again));
    }

    #[tokio::test]
    async fn test_ensure_entry_absent_without_create() {
        let db = sample_db();
        let repository = db.open();
        let req = Requirement {
            name: "carol".to_string(),
            group: GroupRequirement::with_name("sso"),
            groups: vec![GroupRequirement::with_name("sso")],
            shell: "/bin/sh".to_string(),
            home_dir: "/home/carol".to_string(),
            ..Default::default()
        };
        let opts = EnsureOpts {
            create_allowed: false,
            modify_allowed: true,
        };
        assert!(repository.ensure_entry(&req, opts).await.unwrap().is_none());
    }
}
