// Copyright Materialize, Inc. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FieldIssue, ParseLabelError};

/// The type of a feature's value.
///
/// Every feature value in the system — defaults, plan values, and
/// subscription overrides — is a string that must parse under the owning
/// feature's value type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureValueType {
    /// A boolean switch. Valid values are the literals `"true"` and
    /// `"false"`.
    #[default]
    Toggle,
    /// A finite number, such as a quota or limit.
    Numeric,
    /// An arbitrary text blob.
    Text,
}

impl FeatureValueType {
    /// The persisted label for this value type.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureValueType::Toggle => "toggle",
            FeatureValueType::Numeric => "numeric",
            FeatureValueType::Text => "text",
        }
    }

    /// Checks that `value` parses under this value type.
    pub fn validate(&self, value: &str) -> Result<(), String> {
        match self {
            FeatureValueType::Toggle => {
                if value == "true" || value == "false" {
                    Ok(())
                } else {
                    Err(format!("expected \"true\" or \"false\", got {value:?}"))
                }
            }
            FeatureValueType::Numeric => match value.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(()),
                _ => Err(format!("expected a finite number, got {value:?}")),
            },
            FeatureValueType::Text => Ok(()),
        }
    }
}

impl fmt::Display for FeatureValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureValueType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<FeatureValueType, ParseLabelError> {
        match s {
            "toggle" => Ok(FeatureValueType::Toggle),
            "numeric" => Ok(FeatureValueType::Numeric),
            "text" => Ok(FeatureValueType::Text),
            other => Err(ParseLabelError::new("feature value type", other)),
        }
    }
}

/// The longest key the engine accepts.
pub const MAX_KEY_LEN: usize = 255;

/// Checks the syntax of a user-supplied key, appending to `issues` on
/// failure.
///
/// Keys are the contract with external systems: 1–255 characters drawn from
/// ASCII letters, digits, `.`, `_`, and `-`, immutable after creation.
pub(crate) fn check_key(field: &str, key: &str, issues: &mut Vec<FieldIssue>) {
    if key.is_empty() {
        issues.push(FieldIssue::new(field, "key must not be empty"));
    } else if key.len() > MAX_KEY_LEN {
        issues.push(FieldIssue::new(
            field,
            format!("key must be at most {MAX_KEY_LEN} characters"),
        ));
    } else if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
    {
        issues.push(FieldIssue::new(
            field,
            "key may only contain ASCII letters, digits, '.', '_', and '-'",
        ));
    }
}

/// Checks that a metadata document is a JSON object.
pub(crate) fn check_metadata(field: &str, metadata: &serde_json::Value, issues: &mut Vec<FieldIssue>) {
    if !metadata.is_object() {
        issues.push(FieldIssue::new(field, "metadata must be a JSON object"));
    }
}

/// Checks that a feature value parses under `value_type`.
pub(crate) fn check_value(
    field: &str,
    value_type: FeatureValueType,
    value: &str,
    issues: &mut Vec<FieldIssue>,
) {
    if let Err(message) = value_type.validate(value) {
        issues.push(FieldIssue::new(field, message));
    }
}

/// Minimal email shape check. The engine stores the address; delivery
/// concerns live with the caller.
pub(crate) fn check_email(field: &str, email: &str, issues: &mut Vec<FieldIssue>) {
    let well_formed = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty(),
        None => false,
    };
    if !well_formed {
        issues.push(FieldIssue::new(field, "not a valid email address"));
    }
}

/// An empty JSON object, the default metadata document.
pub(crate) fn empty_metadata() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_values() {
        assert!(FeatureValueType::Toggle.validate("true").is_ok());
        assert!(FeatureValueType::Toggle.validate("false").is_ok());
        assert!(FeatureValueType::Toggle.validate("TRUE").is_err());
        assert!(FeatureValueType::Toggle.validate("yes").is_err());
        assert!(FeatureValueType::Toggle.validate("").is_err());
    }

    #[test]
    fn numeric_values() {
        assert!(FeatureValueType::Numeric.validate("3").is_ok());
        assert!(FeatureValueType::Numeric.validate("-12.5").is_ok());
        assert!(FeatureValueType::Numeric.validate(" 42 ").is_ok());
        assert!(FeatureValueType::Numeric.validate("NaN").is_err());
        assert!(FeatureValueType::Numeric.validate("inf").is_err());
        assert!(FeatureValueType::Numeric.validate("ten").is_err());
    }

    #[test]
    fn text_values() {
        assert!(FeatureValueType::Text.validate("").is_ok());
        assert!(FeatureValueType::Text.validate("anything at all").is_ok());
    }

    #[test]
    fn key_syntax() {
        let mut issues = Vec::new();
        check_key("key", "acme-corp.v2_test", &mut issues);
        assert!(issues.is_empty());

        check_key("key", "", &mut issues);
        check_key("key", "has spaces", &mut issues);
        check_key("key", &"x".repeat(MAX_KEY_LEN + 1), &mut issues);
        assert_eq!(issues.len(), 3);
    }

    #[test]
    fn labels_round_trip() {
        for vt in [
            FeatureValueType::Toggle,
            FeatureValueType::Numeric,
            FeatureValueType::Text,
        ] {
            assert_eq!(vt.as_str().parse::<FeatureValueType>().unwrap(), vt);
        }
        assert!("boolean".parse::<FeatureValueType>().is_err());
    }
}
