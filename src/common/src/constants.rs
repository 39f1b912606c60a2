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
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wolkentor/wolkentor.conf";
pub const DEFAULT_SOCK_PATH: &str = "/var/run/wolkentord/socket";

pub const DEFAULT_ETC_PASSWD: &str = "/etc/passwd";
pub const DEFAULT_ETC_GROUP: &str = "/etc/group";
pub const DEFAULT_ETC_SHADOW: &str = "/etc/shadow";

pub const DEFAULT_CONFIGURATION_KEY: &str = "default";
pub const DEFAULT_SHELL: &str = "/bin/sh";
pub const DEFAULT_GROUP_NAME: &str = "sso";
pub const DEFAULT_SCOPES: &str = "openid,profile,email";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_ALLOW_BAD_NAME: bool = true;
pub const DEFAULT_ALLOW_BAD_LINE: bool = true;

/// How long external edits to the colon databases must be quiet before the
/// repository reloads them.
pub const DEFAULT_FS_SYNC_THRESHOLD: Duration = Duration::from_secs(2);

/// Exit status used when the in-memory repository state can no longer be
/// trusted to match disk (asynchronous reload failure).
pub const WATCH_FAILURE_EXIT_CODE: i32 = 17;

/// Default templates applied when a configuration section does not override
/// the user requirement.
pub const DEFAULT_USER_NAME_TEMPLATE: &str = "{{oidc.id_token.claims.email}}";
pub const DEFAULT_USER_DISPLAY_NAME_TEMPLATE: &str = "{{oidc.id_token.claims.name}}";
pub const DEFAULT_USER_HOME_DIR_TEMPLATE: &str = "/home/sso/{{oidc.id_token.claims.email}}";
