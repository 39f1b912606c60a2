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
use std::fmt;

pub mod codec;
pub mod ensure;
pub mod repository;

/// Numeric user id. POSIX ids are 32-bit quantities; the model and the wire
/// carry them as 64-bit, values are checked to fit u32 where they reach
/// OS-level commands or files.
pub type Id = u64;
pub type GroupId = u64;

/// A group as observed in the repository, mirroring one `/etc/group` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub gid: GroupId,
    pub name: String,
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.gid, self.name)
    }
}

/// A user as observed in the repository, mirroring one `/etc/passwd` record
/// joined with its primary group and group memberships. Never constructed
/// speculatively; always the result of a fresh lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub display_name: String,
    pub uid: Id,
    pub group: Group,
    pub groups: Vec<Group>,
    pub shell: String,
    pub home_dir: String,
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.uid, self.name)
    }
}
