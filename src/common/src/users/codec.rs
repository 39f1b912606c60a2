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

//! Codec for the colon-delimited system databases (`/etc/passwd`,
//! `/etc/group`, `/etc/shadow`).
//!
//! One parametric record abstraction covers the three near-identical
//! shapes; each record type supplies its decode/encode/validate strategy.
//! Encoding is the strict inverse of decoding and re-validates before
//! serializing. Lines that do not parse can be preserved verbatim
//! (`allow_bad_line`) so round-tripping a file with foreign entries is
//! lossless.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameViolation {
    Empty,
    TooLong,
    Illegal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    IllegalAmountOfColumns { expected: usize, actual: usize },
    UserName(NameViolation),
    GroupName(NameViolation),
    EmptyUid,
    IllegalUid,
    EmptyGid,
    IllegalGid,
    EmptyHomeDir,
    TooLongHomeDir,
    IllegalHomeDir,
    EmptyShell,
    TooLongShell,
    IllegalShell,
    TooLongGecos,
    IllegalGecos,
    EmptyPassword,
    EmptyLastChangedAt,
    IllegalLastChangedAt,
    IllegalMinimumAge,
    EmptyMaximumAge,
    IllegalMaximumAge,
    IllegalWarnAge,
    IllegalInactiveAge,
    IllegalExpireAt,
    IllegalUnused,
    IllegalUtf8,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn name(f: &mut fmt::Formatter<'_>, what: &str, v: &NameViolation) -> fmt::Result {
            match v {
                NameViolation::Empty => write!(f, "empty {} name", what),
                NameViolation::TooLong => {
                    write!(f, "{} name is longer than 32 characters", what)
                }
                NameViolation::Illegal => write!(f, "illegal {} name", what),
            }
        }
        match self {
            DecodeError::IllegalAmountOfColumns { expected, actual } => write!(
                f,
                "illegal amount of columns; expected {}; but got: {}",
                expected, actual
            ),
            DecodeError::UserName(v) => name(f, "user", v),
            DecodeError::GroupName(v) => name(f, "group", v),
            DecodeError::EmptyUid => f.write_str("empty UID"),
            DecodeError::IllegalUid => f.write_str("illegal UID"),
            DecodeError::EmptyGid => f.write_str("empty GID"),
            DecodeError::IllegalGid => f.write_str("illegal GID"),
            DecodeError::EmptyHomeDir => f.write_str("empty home directory"),
            DecodeError::TooLongHomeDir => {
                f.write_str("home directory is longer than 255 characters")
            }
            DecodeError::IllegalHomeDir => f.write_str("illegal home directory"),
            DecodeError::EmptyShell => f.write_str("empty shell"),
            DecodeError::TooLongShell => f.write_str("shell is longer than 255 characters"),
            DecodeError::IllegalShell => f.write_str("illegal shell"),
            DecodeError::TooLongGecos => f.write_str("gecos is longer than 255 characters"),
            DecodeError::IllegalGecos => f.write_str("illegal gecos"),
            DecodeError::EmptyPassword => f.write_str("empty password"),
            DecodeError::EmptyLastChangedAt => f.write_str("empty last changed at"),
            DecodeError::IllegalLastChangedAt => f.write_str("illegal last changed at"),
            DecodeError::IllegalMinimumAge => f.write_str("illegal minimum age"),
            DecodeError::EmptyMaximumAge => f.write_str("empty maximum age"),
            DecodeError::IllegalMaximumAge => f.write_str("illegal maximum age"),
            DecodeError::IllegalWarnAge => f.write_str("illegal warn age"),
            DecodeError::IllegalInactiveAge => f.write_str("illegal inactive age"),
            DecodeError::IllegalExpireAt => f.write_str("illegal expire at"),
            DecodeError::IllegalUnused => f.write_str("illegal unused (9)"),
            DecodeError::IllegalUtf8 => f.write_str("illegal utf-8 in line"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A decode failure with the file and line it was found at.
#[derive(Debug)]
pub struct FileDecodeError {
    pub file: String,
    pub line: u32,
    pub source: DecodeError,
}

impl fmt::Display for FileDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot parse entry at {}:{}: {}",
            self.file, self.line, self.source
        )
    }
}

impl std::error::Error for FileDecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Strict POSIX-ish name validation: 1-32 bytes, at least one non-numeric
/// permitted character, `_` and `.` anywhere, `-` not at position 0,
/// trailing `$` allowed, `.` and `..` rejected.
pub fn validate_unix_name(name: &str) -> Result<(), NameViolation> {
    let bytes = name.as_bytes();
    let len = bytes.len();
    if len == 0 {
        return Err(NameViolation::Empty);
    }
    if len > 32 {
        return Err(NameViolation::TooLong);
    }
    if name == "." || name == ".." {
        return Err(NameViolation::Illegal);
    }
    let mut non_numeric = false;
    for (i, c) in bytes.iter().enumerate() {
        match c {
            b'a'..=b'z' | b'A'..=b'Z' => non_numeric = true,
            b'0'..=b'9' => {}
            b'_' | b'.' => non_numeric = true,
            b'-' if i > 0 => non_numeric = true,
            b'$' if i == len - 1 => non_numeric = true,
            _ => return Err(NameViolation::Illegal),
        }
    }
    if !non_numeric {
        return Err(NameViolation::Illegal);
    }
    Ok(())
}

/// Relaxed validation used when bad names are tolerated: only rejects
/// empty, overlong, control characters, `\/:*?"<>|,` and a leading `~-+`.
pub fn validate_bad_unix_name(name: &str) -> Result<(), NameViolation> {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return Err(NameViolation::Empty);
    }
    if bytes.len() > 32 {
        return Err(NameViolation::TooLong);
    }
    if name == "." || name == ".." {
        return Err(NameViolation::Illegal);
    }
    for (i, c) in bytes.iter().enumerate() {
        if i == 0 && matches!(c, b'~' | b'-' | b'+') {
            return Err(NameViolation::Illegal);
        }
        if *c < 33 {
            return Err(NameViolation::Illegal);
        }
        if matches!(
            c,
            b'\\' | b'/' | b':' | b'*' | b'?' | b'"' | b'>' | b'<' | b'|' | b','
        ) {
            return Err(NameViolation::Illegal);
        }
    }
    Ok(())
}

fn validate_user_name(name: &str, allow_bad_name: bool) -> Result<(), DecodeError> {
    let result = if allow_bad_name {
        validate_bad_unix_name(name)
    } else {
        validate_unix_name(name)
    };
    result.map_err(DecodeError::UserName)
}

fn validate_group_name(name: &str, allow_bad_name: bool) -> Result<(), DecodeError> {
    let result = if allow_bad_name {
        validate_bad_unix_name(name)
    } else {
        validate_unix_name(name)
    };
    result.map_err(DecodeError::GroupName)
}

fn validate_gecos(v: &str) -> Result<(), DecodeError> {
    if v.len() > 255 {
        return Err(DecodeError::TooLongGecos);
    }
    if v.bytes().any(|c| c == 0 || c == b':' || c == b'\n') {
        return Err(DecodeError::IllegalGecos);
    }
    Ok(())
}

fn validate_path_column(
    v: &str,
    empty: DecodeError,
    too_long: DecodeError,
    illegal: DecodeError,
) -> Result<(), DecodeError> {
    if v.is_empty() {
        return Err(empty);
    }
    if v.len() > 255 {
        return Err(too_long);
    }
    if v.bytes().any(|c| c == 0 || c == b':' || c == b'\n') {
        return Err(illegal);
    }
    Ok(())
}

/// Parse a numeric column. `empty` of `None` makes an empty field a valid
/// "absent" sentinel; the second return tells whether a value was present.
fn parse_u32_column(
    v: &str,
    empty: Option<DecodeError>,
    illegal: DecodeError,
) -> Result<(u32, bool), DecodeError> {
    if v.is_empty() {
        return match empty {
            Some(err) => Err(err),
            None => Ok((0, false)),
        };
    }
    v.parse::<u32>().map(|n| (n, true)).map_err(|_| illegal)
}

/// One record shape of a colon database. Implementations decode from and
/// encode to exactly `COLUMNS` fields, validating on both directions.
pub trait EtcColonEntry: Sized {
    const COLUMNS: usize;

    fn decode(fields: &[&str], allow_bad_name: bool) -> Result<Self, DecodeError>;
    fn encode(&self, allow_bad_name: bool) -> Result<Vec<String>, DecodeError>;
    fn validate(&self, allow_bad_name: bool) -> Result<(), DecodeError>;
}

/// One `/etc/passwd` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcPasswdEntry {
    pub name: String,
    pub password: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home_dir: String,
    pub shell: String,
}

impl EtcColonEntry for EtcPasswdEntry {
    const COLUMNS: usize = 7;

    fn decode(fields: &[&str], allow_bad_name: bool) -> Result<Self, DecodeError> {
        let (uid, _) = parse_u32_column(fields[2], Some(DecodeError::EmptyUid), DecodeError::IllegalUid)?;
        let (gid, _) = parse_u32_column(fields[3], Some(DecodeError::EmptyGid), DecodeError::IllegalGid)?;
        let entry = EtcPasswdEntry {
            name: fields[0].to_string(),
            password: fields[1].to_string(),
            uid,
            gid,
            gecos: fields[4].to_string(),
            home_dir: fields[5].to_string(),
            shell: fields[6].to_string(),
        };
        entry.validate(allow_bad_name)?;
        Ok(entry)
    }

    fn encode(&self, allow_bad_name: bool) -> Result<Vec<String>, DecodeError> {
        self.validate(allow_bad_name)?;
        Ok(vec![
            self.name.clone(),
            self.password.clone(),
            self.uid.to_string(),
            self.gid.to_string(),
            self.gecos.clone(),
            self.home_dir.clone(),
            self.shell.clone(),
        ])
    }

    fn validate(&self, allow_bad_name: bool) -> Result<(), DecodeError> {
        validate_user_name(&self.name, allow_bad_name)?;
        validate_gecos(&self.gecos)?;
        validate_path_column(
            &self.home_dir,
            DecodeError::EmptyHomeDir,
            DecodeError::TooLongHomeDir,
            DecodeError::IllegalHomeDir,
        )?;
        validate_path_column(
            &self.shell,
            DecodeError::EmptyShell,
            DecodeError::TooLongShell,
            DecodeError::IllegalShell,
        )?;
        Ok(())
    }
}

/// One `/etc/group` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcGroupEntry {
    pub name: String,
    pub password: String,
    pub gid: u32,
    pub user_names: Vec<String>,
}

impl EtcGroupEntry {
    pub fn add_unique_user_name(&mut self, username: &str) {
        if !self.user_names.iter().any(|c| c == username) {
            self.user_names.push(username.to_string());
        }
    }

    pub fn remove_user_name(&mut self, username: &str) {
        self.user_names.retain(|c| c != username);
    }
}

impl EtcColonEntry for EtcGroupEntry {
    const COLUMNS: usize = 4;

    fn decode(fields: &[&str], allow_bad_name: bool) -> Result<Self, DecodeError> {
        let (gid, _) = parse_u32_column(fields[2], Some(DecodeError::EmptyGid), DecodeError::IllegalGid)?;
        let user_names = if fields[3].is_empty() {
            Vec::new()
        } else {
            fields[3].split(',').map(str::to_string).collect()
        };
        let entry = EtcGroupEntry {
            name: fields[0].to_string(),
            password: fields[1].to_string(),
            gid,
            user_names,
        };
        entry.validate(allow_bad_name)?;
        Ok(entry)
    }

    fn encode(&self, allow_bad_name: bool) -> Result<Vec<String>, DecodeError> {
        self.validate(allow_bad_name)?;
        Ok(vec![
            self.name.clone(),
            self.password.clone(),
            self.gid.to_string(),
            self.user_names.join(","),
        ])
    }

    fn validate(&self, allow_bad_name: bool) -> Result<(), DecodeError> {
        validate_group_name(&self.name, allow_bad_name)?;
        for un in &self.user_names {
            validate_user_name(un, allow_bad_name)?;
        }
        Ok(())
    }
}

/// One `/etc/shadow` record. Warn/inactive/expire columns distinguish
/// "absent" from zero so a decoded record re-encodes byte-identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcShadowEntry {
    pub name: String,
    pub password: String,
    pub last_changed_at_days: u32,
    pub minimum_age_days: u32,
    pub maximum_age_days: u32,
    pub warn_age_days: u32,
    pub has_warn_age: bool,
    pub inactive_age_days: u32,
    pub has_inactive_age: bool,
    pub expire_at_days: u32,
    pub has_expire: bool,
}

impl EtcColonEntry for EtcShadowEntry {
    const COLUMNS: usize = 9;

    fn decode(fields: &[&str], allow_bad_name: bool) -> Result<Self, DecodeError> {
        let (last_changed_at_days, _) = parse_u32_column(
            fields[2],
            Some(DecodeError::EmptyLastChangedAt),
            DecodeError::IllegalLastChangedAt,
        )?;
        let (minimum_age_days, _) =
            parse_u32_column(fields[3], None, DecodeError::IllegalMinimumAge)?;
        let (maximum_age_days, _) = parse_u32_column(
            fields[4],
            Some(DecodeError::EmptyMaximumAge),
            DecodeError::IllegalMaximumAge,
        )?;
        let (warn_age_days, has_warn_age) =
            parse_u32_column(fields[5], None, DecodeError::IllegalWarnAge)?;
        let (inactive_age_days, has_inactive_age) =
            parse_u32_column(fields[6], None, DecodeError::IllegalInactiveAge)?;
        let (expire_at_days, has_expire) =
            parse_u32_column(fields[7], None, DecodeError::IllegalExpireAt)?;
        if !fields[8].is_empty() {
            return Err(DecodeError::IllegalUnused);
        }
        let entry = EtcShadowEntry {
            name: fields[0].to_string(),
            password: fields[1].to_string(),
            last_changed_at_days,
            minimum_age_days,
            maximum_age_days,
            warn_age_days,
            has_warn_age,
            inactive_age_days,
            has_inactive_age,
            expire_at_days,
            has_expire,
        };
        entry.validate(allow_bad_name)?;
        Ok(entry)
    }

    fn encode(&self, allow_bad_name: bool) -> Result<Vec<String>, DecodeError> {
        self.validate(allow_bad_name)?;
        let optional = |v: u32, has: bool| if has { v.to_string() } else { String::new() };
        Ok(vec![
            self.name.clone(),
            self.password.clone(),
            self.last_changed_at_days.to_string(),
            self.minimum_age_days.to_string(),
            self.maximum_age_days.to_string(),
            optional(self.warn_age_days, self.has_warn_age),
            optional(self.inactive_age_days, self.has_inactive_age),
            optional(self.expire_at_days, self.has_expire),
            String::new(),
        ])
    }

    fn validate(&self, allow_bad_name: bool) -> Result<(), DecodeError> {
        validate_user_name(&self.name, allow_bad_name)?;
        if self.password.is_empty() {
            return Err(DecodeError::EmptyPassword);
        }
        Ok(())
    }
}

/// One line of a colon database: either a decoded entry or, when bad lines
/// are allowed, the original line preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EtcColonRecord<T> {
    Entry(T),
    Raw(String),
}

impl<T> EtcColonRecord<T> {
    pub fn entry(&self) -> Option<&T> {
        match self {
            EtcColonRecord::Entry(e) => Some(e),
            EtcColonRecord::Raw(_) => None,
        }
    }

    pub fn entry_mut(&mut self) -> Option<&mut T> {
        match self {
            EtcColonRecord::Entry(e) => Some(e),
            EtcColonRecord::Raw(_) => None,
        }
    }
}

/// An entire decoded colon database, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcColonFile<T> {
    pub records: Vec<EtcColonRecord<T>>,
}

impl<T> Default for EtcColonFile<T> {
    fn default() -> Self {
        EtcColonFile {
            records: Vec::new(),
        }
    }
}

impl<T: EtcColonEntry> EtcColonFile<T> {
    pub fn new() -> Self {
        EtcColonFile {
            records: Vec::new(),
        }
    }

    pub fn decode_str(
        content: &str,
        allow_bad_name: bool,
        allow_bad_line: bool,
        file: &str,
    ) -> Result<Self, FileDecodeError> {
        let mut records = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            match Self::decode_line(line, allow_bad_name) {
                Ok(entry) => records.push(EtcColonRecord::Entry(entry)),
                Err(_) if allow_bad_line => records.push(EtcColonRecord::Raw(line.to_string())),
                Err(source) => {
                    return Err(FileDecodeError {
                        file: file.to_string(),
                        line: line_num as u32,
                        source,
                    })
                }
            }
        }
        Ok(EtcColonFile { records })
    }

    fn decode_line(line: &str, allow_bad_name: bool) -> Result<T, DecodeError> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != T::COLUMNS {
            return Err(DecodeError::IllegalAmountOfColumns {
                expected: T::COLUMNS,
                actual: fields.len(),
            });
        }
        T::decode(&fields, allow_bad_name)
    }

    pub fn encode_to_string(&self, allow_bad_name: bool) -> Result<String, DecodeError> {
        let mut out = String::new();
        for record in &self.records {
            match record {
                EtcColonRecord::Entry(entry) => {
                    out.push_str(&entry.encode(allow_bad_name)?.join(":"));
                }
                EtcColonRecord::Raw(line) => out.push_str(line),
            }
            out.push('\n');
        }
        Ok(out)
    }

    pub fn entries(&self) -> impl Iterator<Item = &T> {
        self.records.iter().filter_map(EtcColonRecord::entry)
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.records.iter_mut().filter_map(EtcColonRecord::entry_mut)
    }

    pub fn push(&mut self, entry: T) {
        self.records.push(EtcColonRecord::Entry(entry));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
                          alice:x:1000:1000:Alice Example:/home/alice:/bin/bash\n";
    const GROUP: &str = "root:x:0:\nsso:x:1000:alice,bob\n";
    const SHADOW: &str = "alice:*:19000:0:99999:7:::\n";

    #[test]
    fn test_passwd_round_trip() {
        let db: EtcColonFile<EtcPasswdEntry> =
            EtcColonFile::decode_str(PASSWD, false, false, "/etc/passwd").unwrap();
        assert_eq!(db.entries().count(), 2);
        assert_eq!(db.encode_to_string(false).unwrap(), PASSWD.to_string());
    }

    #[test]
    fn test_group_round_trip() {
        let db: EtcColonFile<EtcGroupEntry> =
            EtcColonFile::decode_str(GROUP, false, false, "/etc/group").unwrap();
        let sso = db.entries().find(|e| e.name == "sso").unwrap();
        assert_eq!(sso.user_names, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(db.encode_to_string(false).unwrap(), GROUP.to_string());
    }

    #[test]
    fn test_shadow_round_trip_preserves_absent_columns() {
        let db: EtcColonFile<EtcShadowEntry> =
            EtcColonFile::decode_str(SHADOW, false, false, "/etc/shadow").unwrap();
        let entry = db.entries().next().unwrap();
        assert!(entry.has_warn_age);
        assert!(!entry.has_inactive_age);
        assert!(!entry.has_expire);
        assert_eq!(db.encode_to_string(false).unwrap(), SHADOW.to_string());
    }

    #[test]
    fn test_column_count_error_names_counts() {
        let err = EtcColonFile::<EtcPasswdEntry>::decode_str(
            "alice:x:1000:1000:/home/alice:/bin/bash\n",
            false,
            false,
            "/etc/passwd",
        )
        .unwrap_err();
        assert_eq!(
            err.source,
            DecodeError::IllegalAmountOfColumns {
                expected: 7,
                actual: 6
            }
        );
        assert_eq!(err.line, 0);
        assert!(err.to_string().contains("expected 7"));
        assert!(err.to_string().contains("got: 6"));
    }

    #[test]
    fn test_bad_line_is_preserved_verbatim() {
        let content = "alice:x:1000:1000:Alice:/home/alice:/bin/bash\nthis is no passwd line\n";
        let db: EtcColonFile<EtcPasswdEntry> =
            EtcColonFile::decode_str(content, false, true, "/etc/passwd").unwrap();
        assert_eq!(db.entries().count(), 1);
        assert_eq!(db.encode_to_string(false).unwrap(), content.to_string());
    }

    #[test]
    fn test_name_length_boundary() {
        let ok = "a".repeat(32);
        let too_long = "a".repeat(33);
        assert!(validate_unix_name(&ok).is_ok());
        assert_eq!(validate_unix_name(&too_long), Err(NameViolation::TooLong));
        assert_eq!(
            validate_bad_unix_name(&too_long),
            Err(NameViolation::TooLong)
        );
    }

    #[test]
    fn test_numeric_only_name_needs_relaxed_mode() {
        assert_eq!(validate_unix_name("1000"), Err(NameViolation::Illegal));
        assert!(validate_bad_unix_name("1000").is_ok());
    }

    #[test]
    fn test_name_character_rules() {
        assert!(validate_unix_name("alice").is_ok());
        assert!(validate_unix_name("alice.b-c_d$").is_ok());
        assert_eq!(validate_unix_name("-alice"), Err(NameViolation::Illegal));
        assert_eq!(validate_unix_name("."), Err(NameViolation::Illegal));
        assert_eq!(validate_unix_name(".."), Err(NameViolation::Illegal));
        assert_eq!(
            validate_unix_name("alice@example.com"),
            Err(NameViolation::Illegal)
        );
        // The relaxed mode tolerates the at sign but not a leading tilde.
        assert!(validate_bad_unix_name("alice@example.com").is_ok());
        assert_eq!(validate_bad_unix_name("~alice"), Err(NameViolation::Illegal));
        assert_eq!(validate_bad_unix_name("a,b"), Err(NameViolation::Illegal));
        assert_eq!(validate_bad_unix_name(""), Err(NameViolation::Empty));
    }

    #[test]
    fn test_empty_uid_is_an_error() {
        let err = EtcColonFile::<EtcPasswdEntry>::decode_str(
            "alice:x::1000:Alice:/home/alice:/bin/bash\n",
            false,
            false,
            "/etc/passwd",
        )
        .unwrap_err();
        assert_eq!(err.source, DecodeError::EmptyUid);
    }

    #[test]
    fn test_negative_uid_is_illegal() {
        let err = EtcColonFile::<EtcPasswdEntry>::decode_str(
            "alice:x:-7:1000:Alice:/home/alice:/bin/bash\n",
            false,
            false,
            "/etc/passwd",
        )
        .unwrap_err();
        assert_eq!(err.source, DecodeError::IllegalUid);
    }

    #[test]
    fn test_shadow_trailing_column_must_be_empty() {
        let err = EtcColonFile::<EtcShadowEntry>::decode_str(
            "alice:*:19000:0:99999:7:::oops\n",
            false,
            false,
            "/etc/shadow",
        )
        .unwrap_err();
        assert_eq!(err.source, DecodeError::IllegalUnused);
    }

    #[test]
    fn test_encode_revalidates() {
        let entry = EtcPasswdEntry {
            name: "alice".to_string(),
            password: "x".to_string(),
            uid: 1000,
            gid: 1000,
            gecos: "Alice".to_string(),
            home_dir: String::new(),
            shell: "/bin/bash".to_string(),
        };
        assert_eq!(entry.encode(false), Err(DecodeError::EmptyHomeDir));
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let db: EtcColonFile<EtcPasswdEntry> = EtcColonFile::decode_str(
            "\nalice:x:1000:1000:Alice:/home/alice:/bin/bash\n\n",
            false,
            false,
            "/etc/passwd",
        )
        .unwrap();
        assert_eq!(db.entries().count(), 1);
    }
}
