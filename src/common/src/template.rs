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

//! Field templates rendered against the claims-shaped context built from
//! the OIDC exchange (`oidc.token`, `oidc.id_token.claims.*`,
//! `oidc.user_info.claims.*`).
//!
//! A template is literal text with `{{ dotted.path }}` placeholders. String
//! fields yield a String, uint fields parse the rendered text as u64 (empty
//! means unset). Rendering a whole requirement is all-or-nothing; the first
//! failing field aborts with its dotted field path attached.

use std::fmt;

use serde_json::Value;

use crate::errors::AuthError;
use crate::users::ensure::{GroupRequirement, Requirement};

#[derive(Debug)]
pub struct RenderError {
    /// Dotted path of the failing field, e.g. `user.group.gid`.
    pub field: String,
    pub message: String,
}

impl RenderError {
    fn new(message: impl Into<String>) -> Self {
        RenderError {
            field: String::new(),
            message: message.into(),
        }
    }

    pub fn at(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "[{}] {}", self.field, self.message)
        }
    }
}

impl std::error::Error for RenderError {}

fn lookup<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = ctx;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn render_value(value: &Value, path: &str) -> Result<String, RenderError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        Value::Array(_) | Value::Object(_) => Err(RenderError::new(format!(
            "cannot render non-scalar value at {:?}",
            path
        ))),
    }
}

fn render_str(template: &str, ctx: &Value) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(RenderError::new(format!(
                "unterminated placeholder in template {:?}",
                template
            )));
        };
        let path = after[..end].trim();
        if path.is_empty() {
            return Err(RenderError::new(format!(
                "empty placeholder in template {:?}",
                template
            )));
        }
        let value = lookup(ctx, path)
            .ok_or_else(|| RenderError::new(format!("no such value at {:?}", path)))?;
        out.push_str(&render_value(value, path)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// A template producing a string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringTemplate(String);

impl StringTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        StringTemplate(template.into())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub fn render(&self, ctx: &Value) -> Result<String, RenderError> {
        render_str(&self.0, ctx)
    }
}

/// A template producing an unsigned integer; an empty rendering means the
/// field is unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UintTemplate(String);

impl UintTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        UintTemplate(template.into())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub fn render(&self, ctx: &Value) -> Result<Option<u64>, RenderError> {
        let raw = render_str(&self.0, ctx)?;
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<u64>().map(Some).map_err(|_| {
            RenderError::new(format!("cannot parse {:?} as unsigned integer", raw))
        })
    }
}

/// A template producing a boolean; an empty rendering falls back to the
/// provided default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoolTemplate(String);

impl BoolTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        BoolTemplate(template.into())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub fn render(&self, ctx: &Value, default: bool) -> Result<bool, RenderError> {
        let raw = render_str(&self.0, ctx)?;
        match raw.to_lowercase().as_str() {
            "" => Ok(default),
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            other => Err(RenderError::new(format!(
                "cannot parse {:?} as boolean",
                other
            ))),
        }
    }
}

/// Per-field templates producing a [GroupRequirement].
#[derive(Debug, Clone, Default)]
pub struct GroupRequirementTemplate {
    pub gid: UintTemplate,
    pub name: StringTemplate,
}

impl GroupRequirementTemplate {
    pub fn is_zero(&self) -> bool {
        self.gid.is_zero() && self.name.is_zero()
    }

    pub fn render(&self, key: &str, ctx: &Value) -> Result<GroupRequirement, RenderError> {
        Ok(GroupRequirement {
            gid: self
                .gid
                .render(ctx)
                .map_err(|e| e.at(format!("{}.gid", key)))?,
            name: self
                .name
                .render(ctx)
                .map_err(|e| e.at(format!("{}.name", key)))?,
        })
    }
}

/// Per-field templates producing a whole [Requirement]. Rendering is
/// all-or-nothing; the first failing field aborts with its dotted path.
#[derive(Debug, Clone, Default)]
pub struct RequirementTemplate {
    pub name: StringTemplate,
    pub display_name: StringTemplate,
    pub uid: UintTemplate,
    pub group: GroupRequirementTemplate,
    pub groups: Vec<GroupRequirementTemplate>,
    pub shell: StringTemplate,
    pub home_dir: StringTemplate,
    pub skel: StringTemplate,
}

impl RequirementTemplate {
    pub fn validate(&self, key: &str) -> Result<(), AuthError> {
        if self.name.is_zero() && self.uid.is_zero() {
            return Err(AuthError::configuration(format!(
                "{} requires at least one of the options name or uid",
                key
            )));
        }
        Ok(())
    }

    pub fn render(&self, key: &str, ctx: &Value) -> Result<Requirement, RenderError> {
        let mut groups = Vec::with_capacity(self.groups.len());
        for (i, template) in self.groups.iter().enumerate() {
            groups.push(template.render(&format!("{}.groups.{}", key, i), ctx)?);
        }
        Ok(Requirement {
            name: self
                .name
                .render(ctx)
                .map_err(|e| e.at(format!("{}.name", key)))?,
            display_name: self
                .display_name
                .render(ctx)
                .map_err(|e| e.at(format!("{}.displayName", key)))?,
            uid: self
                .uid
                .render(ctx)
                .map_err(|e| e.at(format!("{}.uid", key)))?,
            group: self.group.render(&format!("{}.group", key), ctx)?,
            groups,
            shell: self
                .shell
                .render(ctx)
                .map_err(|e| e.at(format!("{}.shell", key)))?,
            home_dir: self
                .home_dir
                .render(ctx)
                .map_err(|e| e.at(format!("{}.homeDir", key)))?,
            skel: self
                .skel
                .render(ctx)
                .map_err(|e| e.at(format!("{}.skel", key)))?,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "oidc": {
                "token": { "access_token": "at-123", "token_type": "Bearer" },
                "id_token": { "claims": { "email": "alice@example.com", "name": "Alice", "uid": 1442 } },
                "user_info": { "claims": { "email_verified": true } },
            }
        })
    }

    #[test]
    fn test_render_literal() {
        let t = StringTemplate::new("/bin/bash");
        assert_eq!(t.render(&ctx()).unwrap(), "/bin/bash".to_string());
    }

    #[test]
    fn test_render_placeholder() {
        let t = StringTemplate::new("{{oidc.id_token.claims.email}}");
        assert_eq!(t.render(&ctx()).unwrap(), "alice@example.com".to_string());
    }

    #[test]
    fn test_render_mixed_and_spaced() {
        let t = StringTemplate::new("/home/sso/{{ oidc.id_token.claims.email }}");
        assert_eq!(
            t.render(&ctx()).unwrap(),
            "/home/sso/alice@example.com".to_string()
        );
    }

    #[test]
    fn test_render_missing_path() {
        let t = StringTemplate::new("{{oidc.id_token.claims.nope}}");
        let err = t.render(&ctx()).unwrap_err();
        assert!(err.message.contains("no such value"));
    }

    #[test]
    fn test_render_unterminated() {
        let t = StringTemplate::new("{{oidc.id_token");
        assert!(t.render(&ctx()).is_err());
    }

    #[test]
    fn test_render_non_scalar() {
        let t = StringTemplate::new("{{oidc.id_token.claims}}");
        assert!(t.render(&ctx()).is_err());
    }

    #[test]
    fn test_uint_from_claim() {
        let t = UintTemplate::new("{{oidc.id_token.claims.uid}}");
        assert_eq!(t.render(&ctx()).unwrap(), Some(1442));
    }

    #[test]
    fn test_uint_empty_is_unset() {
        let t = UintTemplate::new("");
        assert_eq!(t.render(&ctx()).unwrap(), None);
    }

    #[test]
    fn test_uint_garbage_fails() {
        let t = UintTemplate::new("{{oidc.id_token.claims.email}}");
        assert!(t.render(&ctx()).is_err());
    }

    #[test]
    fn test_bool_defaulting() {
        assert!(BoolTemplate::new("").render(&ctx(), true).unwrap());
        assert!(!BoolTemplate::new("false").render(&ctx(), true).unwrap());
        assert!(BoolTemplate::new("{{oidc.user_info.claims.email_verified}}")
            .render(&ctx(), false)
            .unwrap());
    }

    #[test]
    fn test_error_attaches_field_path() {
        let t = UintTemplate::new("x");
        let err = t.render(&ctx()).unwrap_err().at("user.group.gid");
        assert_eq!(
            err.to_string(),
            "[user.group.gid] cannot parse \"x\" as unsigned integer".to_string()
        );
    }

    fn requirement_template() -> RequirementTemplate {
        RequirementTemplate {
            name: StringTemplate::new("{{oidc.id_token.claims.email}}"),
            display_name: StringTemplate::new("{{oidc.id_token.claims.name}}"),
            group: GroupRequirementTemplate {
                gid: UintTemplate::new(""),
                name: StringTemplate::new("sso"),
            },
            home_dir: StringTemplate::new("/home/sso/{{oidc.id_token.claims.email}}"),
            ..Default::default()
        }
    }

    #[test]
    fn test_requirement_render() {
        let req = requirement_template().render("user", &ctx()).unwrap();
        assert_eq!(req.name, "alice@example.com".to_string());
        assert_eq!(req.display_name, "Alice".to_string());
        assert_eq!(req.uid, None);
        assert_eq!(req.group.name, "sso".to_string());
        assert_eq!(req.home_dir, "/home/sso/alice@example.com".to_string());
    }

    #[test]
    fn test_requirement_render_is_all_or_nothing() {
        let mut template = requirement_template();
        template.uid = UintTemplate::new("{{oidc.id_token.claims.name}}");
        let err = template.render("user", &ctx()).unwrap_err();
        assert_eq!(err.field, "user.uid".to_string());
    }

    #[test]
    fn test_requirement_template_validation() {
        assert!(requirement_template().validate("user").is_ok());
        let empty = RequirementTemplate::default();
        assert!(empty.validate("user").is_err());
    }
}
