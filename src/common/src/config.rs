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

//! Configuration loading.
//!
//! `/etc/wolkentor/wolkentor.conf` is an INI file. The `[global]` section
//! carries daemon-level settings; every other section defines one named
//! [Configuration], keyed by the section name. Configurations are loaded
//! once and immutable thereafter.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use configparser::ini::Ini;
use regex::Regex;

use crate::constants::{
    DEFAULT_ALLOW_BAD_LINE, DEFAULT_ALLOW_BAD_NAME, DEFAULT_CONFIGURATION_KEY,
    DEFAULT_CONFIG_PATH, DEFAULT_ETC_GROUP, DEFAULT_ETC_PASSWD, DEFAULT_ETC_SHADOW,
    DEFAULT_GROUP_NAME, DEFAULT_SCOPES, DEFAULT_SOCK_PATH, DEFAULT_TIMEOUT,
    DEFAULT_USER_DISPLAY_NAME_TEMPLATE, DEFAULT_USER_HOME_DIR_TEMPLATE,
    DEFAULT_USER_NAME_TEMPLATE,
};
use crate::errors::AuthError;
use crate::template::{
    BoolTemplate, GroupRequirementTemplate, RequirementTemplate, StringTemplate, UintTemplate,
};

/// Key a [Configuration] is registered under: a non-empty, case-sensitive
/// ASCII token of `[A-Za-z0-9.-]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigurationKey(String);

impl ConfigurationKey {
    /// Wraps raw text without validating it; used on the wire decode path
    /// where an illegal key is reported back to the client instead of
    /// failing the decode.
    pub fn raw(text: impl Into<String>) -> Self {
        ConfigurationKey(text.into())
    }

    pub fn parse(text: &str) -> Result<Self, AuthError> {
        let key = ConfigurationKey(text.to_string());
        key.validate()?;
        Ok(key)
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        if self.0.is_empty() {
            return Err(AuthError::configuration("illegal configuration key: empty"));
        }
        for c in self.0.chars() {
            if !(c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return Err(AuthError::configuration(format!(
                    "illegal configuration key: {:?}",
                    self.0
                )));
            }
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for ConfigurationKey {
    fn default() -> Self {
        ConfigurationKey(DEFAULT_CONFIGURATION_KEY.to_string())
    }
}

impl fmt::Display for ConfigurationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConfigurationKey {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Which backend reconciles identities: the external account-management
/// tools, or direct writes to the colon databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureBackend {
    Exec,
    Direct,
}

/// Daemon-level settings from the `[global]` section.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub socket_path: String,
    pub socket_mode: Option<u32>,
    pub socket_owner: Option<String>,
    pub socket_group: Option<String>,
    pub passwd_file: PathBuf,
    pub group_file: PathBuf,
    pub shadow_file: PathBuf,
    pub allow_bad_name: bool,
    pub allow_bad_line: bool,
    pub default_group: String,
    pub ensure_backend: EnsureBackend,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            socket_path: DEFAULT_SOCK_PATH.to_string(),
            socket_mode: None,
            socket_owner: None,
            socket_group: None,
            passwd_file: PathBuf::from(DEFAULT_ETC_PASSWD),
            group_file: PathBuf::from(DEFAULT_ETC_GROUP),
            shadow_file: PathBuf::from(DEFAULT_ETC_SHADOW),
            allow_bad_name: DEFAULT_ALLOW_BAD_NAME,
            allow_bad_line: DEFAULT_ALLOW_BAD_LINE,
            default_group: DEFAULT_GROUP_NAME.to_string(),
            ensure_backend: EnsureBackend::Exec,
        }
    }
}

/// One named authentication configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub key: ConfigurationKey,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
    pub timeout: Duration,
    pub allowed_username: Option<Regex>,
    pub forbidden_username: Option<Regex>,
    pub login_allowed: BoolTemplate,
    pub create_if_absent: bool,
    pub modify_if_different: bool,
    pub retrieve_id_token: bool,
    pub retrieve_user_info: bool,
    pub user: RequirementTemplate,
}

fn match_bool(val: Option<String>, option: &str, default: bool) -> Result<bool, AuthError> {
    match val {
        Some(val) => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            other => Err(AuthError::configuration(format!(
                "illegal boolean for {}: {:?}",
                option, other
            ))),
        },
        None => Ok(default),
    }
}

fn parse_regex(val: Option<String>, option: &str) -> Result<Option<Regex>, AuthError> {
    match val {
        Some(v) if !v.is_empty() => Regex::new(&v).map(Some).map_err(|e| {
            AuthError::with_source(
                crate::errors::ErrorKind::Configuration,
                format!("illegal regex for {}", option),
                e,
            )
        }),
        _ => Ok(None),
    }
}

fn split_list(val: Option<String>, default: &str) -> Vec<String> {
    val.unwrap_or_else(|| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Configuration {
    fn from_section(ini: &Ini, section: &str) -> Result<Self, AuthError> {
        let key = ConfigurationKey::parse(section)?;
        let get = |option: &str| ini.get(section, option);

        let issuer = get("oidc_issuer").ok_or_else(|| {
            AuthError::configuration(format!(
                "configuration {:?} misses required option oidc_issuer",
                section
            ))
        })?;
        let client_id = get("oidc_client_id").ok_or_else(|| {
            AuthError::configuration(format!(
                "configuration {:?} misses required option oidc_client_id",
                section
            ))
        })?;
        let client_secret = get("oidc_client_secret").filter(|s| !s.is_empty());
        let scopes = split_list(get("oidc_scopes"), DEFAULT_SCOPES);

        let timeout = match get("timeout") {
            Some(v) => {
                let secs = v.parse::<u64>().map_err(|_| {
                    AuthError::configuration(format!(
                        "illegal timeout for configuration {:?}: {:?}",
                        section, v
                    ))
                })?;
                if secs == 0 {
                    return Err(AuthError::configuration(format!(
                        "timeout of configuration {:?} has to be positive",
                        section
                    )));
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_TIMEOUT,
        };

        let user = RequirementTemplate {
            name: StringTemplate::new(
                get("user_name").unwrap_or_else(|| DEFAULT_USER_NAME_TEMPLATE.to_string()),
            ),
            display_name: StringTemplate::new(
                get("user_display_name")
                    .unwrap_or_else(|| DEFAULT_USER_DISPLAY_NAME_TEMPLATE.to_string()),
            ),
            uid: UintTemplate::new(get("user_uid").unwrap_or_default()),
            group: GroupRequirementTemplate {
                gid: UintTemplate::new(get("user_primary_group_gid").unwrap_or_default()),
                name: StringTemplate::new(
                    get("user_primary_group_name")
                        .unwrap_or_else(|| DEFAULT_GROUP_NAME.to_string()),
                ),
            },
            groups: split_list(get("user_groups"), "")
                .into_iter()
                .map(|name| GroupRequirementTemplate {
                    gid: UintTemplate::new(""),
                    name: StringTemplate::new(name),
                })
                .collect(),
            shell: StringTemplate::new(get("user_shell").unwrap_or_default()),
            home_dir: StringTemplate::new(
                get("user_home_dir").unwrap_or_else(|| DEFAULT_USER_HOME_DIR_TEMPLATE.to_string()),
            ),
            skel: StringTemplate::new(get("user_skel").unwrap_or_default()),
        };
        user.validate(&format!("configuration {:?} user", section))?;

        Ok(Configuration {
            key,
            issuer,
            client_id,
            client_secret,
            scopes,
            timeout,
            allowed_username: parse_regex(get("allowed_username"), "allowed_username")?,
            forbidden_username: parse_regex(get("forbidden_username"), "forbidden_username")?,
            login_allowed: BoolTemplate::new(get("login_allowed").unwrap_or_default()),
            create_if_absent: match_bool(get("create_if_absent"), "create_if_absent", true)?,
            modify_if_different: match_bool(
                get("modify_if_different"),
                "modify_if_different",
                true,
            )?,
            retrieve_id_token: match_bool(get("retrieve_id_token"), "retrieve_id_token", true)?,
            retrieve_user_info: match_bool(get("retrieve_user_info"), "retrieve_user_info", true)?,
            user,
        })
    }
}

/// All configurations of one config file, keyed by section name, plus the
/// `[global]` daemon settings.
#[derive(Debug)]
pub struct ConfigurationStore {
    global: GlobalConfig,
    by_key: BTreeMap<ConfigurationKey, Arc<Configuration>>,
}

impl ConfigurationStore {
    pub fn load(config_path: Option<&str>) -> Result<Self, AuthError> {
        let filename = config_path.unwrap_or(DEFAULT_CONFIG_PATH);
        let mut ini = Ini::new_cs();
        if Path::new(filename).exists() {
            ini.load(filename).map_err(|e| {
                AuthError::configuration(format!(
                    "failed to read config from {} - cannot start up: {}",
                    filename, e
                ))
            })?;
        } else {
            debug!("config file {} does not exist; using defaults", filename);
        }
        Self::from_ini(&ini)
    }

    pub fn load_from_str(content: &str) -> Result<Self, AuthError> {
        let mut ini = Ini::new_cs();
        ini.read(content.to_string())
            .map_err(|e| AuthError::configuration(format!("failed to read config: {}", e)))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, AuthError> {
        let mut global = GlobalConfig::default();
        if let Some(v) = ini.get("global", "socket_path") {
            global.socket_path = v;
        }
        if let Some(v) = ini.get("global", "socket_mode") {
            let mode = u32::from_str_radix(&v, 8).map_err(|_| {
                AuthError::configuration(format!("illegal socket_mode: {:?}", v))
            })?;
            global.socket_mode = Some(mode);
        }
        global.socket_owner = ini.get("global", "socket_owner").filter(|s| !s.is_empty());
        global.socket_group = ini.get("global", "socket_group").filter(|s| !s.is_empty());
        if let Some(v) = ini.get("global", "passwd_file") {
            global.passwd_file = PathBuf::from(v);
        }
        if let Some(v) = ini.get("global", "group_file") {
            global.group_file = PathBuf::from(v);
        }
        if let Some(v) = ini.get("global", "shadow_file") {
            global.shadow_file = PathBuf::from(v);
        }
        global.allow_bad_name = match_bool(
            ini.get("global", "allow_bad_name"),
            "allow_bad_name",
            DEFAULT_ALLOW_BAD_NAME,
        )?;
        global.allow_bad_line = match_bool(
            ini.get("global", "allow_bad_line"),
            "allow_bad_line",
            DEFAULT_ALLOW_BAD_LINE,
        )?;
        if let Some(v) = ini.get("global", "default_group") {
            global.default_group = v;
        }
        if let Some(v) = ini.get("global", "ensure_backend") {
            global.ensure_backend = match v.to_lowercase().as_str() {
                "exec" => EnsureBackend::Exec,
                "direct" => EnsureBackend::Direct,
                other => {
                    return Err(AuthError::configuration(format!(
                        "illegal ensure_backend: {:?}",
                        other
                    )))
                }
            };
        }

        let mut by_key = BTreeMap::new();
        for section in ini.sections() {
            if section == "global" {
                continue;
            }
            let configuration = Configuration::from_section(ini, &section)?;
            by_key.insert(
                configuration.key.clone(),
                Arc::new(configuration),
            );
        }

        Ok(ConfigurationStore { global, by_key })
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn get(&self, key: &ConfigurationKey) -> Option<Arc<Configuration>> {
        self.by_key.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ConfigurationKey> {
        self.by_key.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const SAMPLE: &str = r#"
[global]
socket_path = /tmp/wolkentor-test.sock
socket_mode = 0666
default_group = cloud

[default]
oidc_issuer = https://idp.example.com/realms/test
oidc_client_id = login-client
oidc_scopes = openid, profile, email
timeout = 120
forbidden_username = ^root$

[ops.admins]
oidc_issuer = https://idp.example.com/realms/ops
oidc_client_id = ops-client
oidc_client_secret = hunter2
allowed_username = ^[a-z]+$
user_primary_group_name = ops
"#;

    #[test]
    fn test_load_sections_as_keys() {
        let store = ConfigurationStore::load_from_str(SAMPLE).unwrap();
        assert_eq!(
            store.keys(),
            vec![
                ConfigurationKey::parse("default").unwrap(),
                ConfigurationKey::parse("ops.admins").unwrap(),
            ]
        );
        assert_eq!(store.global().socket_path, "/tmp/wolkentor-test.sock".to_string());
        assert_eq!(store.global().socket_mode, Some(0o666));
        assert_eq!(store.global().default_group, "cloud".to_string());
    }

    #[test]
    fn test_configuration_values_and_defaults() {
        let store = ConfigurationStore::load_from_str(SAMPLE).unwrap();
        let conf = store.get(&ConfigurationKey::default()).unwrap();
        assert_eq!(conf.issuer, "https://idp.example.com/realms/test".to_string());
        assert_eq!(conf.timeout, Duration::from_secs(120));
        assert_eq!(
            conf.scopes,
            vec!["openid".to_string(), "profile".to_string(), "email".to_string()]
        );
        assert!(conf.client_secret.is_none());
        assert!(conf.forbidden_username.as_ref().unwrap().is_match("root"));
        assert!(conf.create_if_absent);
        assert!(conf.modify_if_different);

        let ops = store.get(&ConfigurationKey::parse("ops.admins").unwrap()).unwrap();
        assert_eq!(ops.client_secret, Some("hunter2".to_string()));
        assert!(ops.allowed_username.as_ref().unwrap().is_match("alice"));
    }

    #[test]
    fn test_unknown_key_is_absent() {
        let store = ConfigurationStore::load_from_str(SAMPLE).unwrap();
        assert!(store.get(&ConfigurationKey::raw("nope")).is_none());
    }

    #[test]
    fn test_missing_issuer_is_rejected() {
        let err = ConfigurationStore::load_from_str(
            "[default]\noidc_client_id = x\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("oidc_issuer"));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let err = ConfigurationStore::load_from_str(
            "[default]\noidc_issuer = https://x\noidc_client_id = x\ntimeout = 0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn test_illegal_regex_is_rejected() {
        let err = ConfigurationStore::load_from_str(
            "[default]\noidc_issuer = https://x\noidc_client_id = x\nallowed_username = [\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("allowed_username"));
    }

    #[test]
    fn test_configuration_key_validation() {
        assert!(ConfigurationKey::parse("default").is_ok());
        assert!(ConfigurationKey::parse("ops.Admins-2").is_ok());
        assert!(ConfigurationKey::parse("").is_err());
        assert!(ConfigurationKey::parse("with space").is_err());
        assert!(ConfigurationKey::parse("slash/y").is_err());
        assert!(ConfigurationKey::raw("still/raw").validate().is_err());
    }
}
