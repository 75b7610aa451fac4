// Copyright 2023 Comcast Cable Communications Management, LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0
//

use crate::utils::error::UspError;

pub const DM_ROOT: &str = "Device.";
pub const INSTANCE_PLACEHOLDER: &str = "{i}";

/// Validates a path prefix offered in a Register message. The prefix must
/// start with `Device.`, end with `.`, contain only alphanumerics and dots,
/// and be free of literal instance numbers and `{i}` placeholders.
pub fn validate_register_path(path: &str) -> Result<(), UspError> {
    if !path.starts_with(DM_ROOT) {
        return Err(UspError::RegisterFailure);
    }

    if !path.ends_with('.') {
        return Err(UspError::RegisterFailure);
    }

    if !path.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
        return Err(UspError::RegisterFailure);
    }

    // A segment starting with a digit would be a literal instance number
    for segment in path.split('.') {
        if segment.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(UspError::RegisterFailure);
        }
    }

    Ok(())
}

/// Converts an instantiated path into its schema path by replacing every
/// purely numeric segment with the `{i}` placeholder.
/// `Device.X.Z.5.Y` becomes `Device.X.Z.{i}.Y`.
pub fn to_schema_path(path: &str) -> String {
    let trailing_dot = path.ends_with('.');
    let mut segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    for seg in segments.iter_mut() {
        if !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit()) {
            *seg = INSTANCE_PLACEHOLDER;
        }
    }
    let mut out = segments.join(".");
    if trailing_dot {
        out.push('.');
    }
    out
}

/// Returns the trailing instance number of an instantiated object path,
/// e.g. `Device.X.Z.5.` yields 5.
pub fn trailing_instance_number(path: &str) -> Option<u32> {
    path.trim_end_matches('.')
        .rsplit('.')
        .next()
        .and_then(|seg| seg.parse::<u32>().ok())
}

/// True if `path` is a strict descendant of (or equal to) the object
/// prefix `parent` (which carries a trailing dot).
pub fn is_child_of(path: &str, parent: &str) -> bool {
    path.starts_with(parent) || path == parent.trim_end_matches('.')
}

/// Matches an absolute path against a subscription path specification,
/// which may be absolute, a partial path (trailing dot) or contain
/// wildcard instance segments (`*` or `{i}`).
pub fn is_path_match(absolute: &str, spec: &str) -> bool {
    if spec.ends_with('.') {
        // Partial path: every descendant matches
        return segments_match_prefix(absolute, spec.trim_end_matches('.'));
    }
    segments_match_exact(absolute, spec)
}

fn segment_matches(abs_seg: &str, spec_seg: &str) -> bool {
    spec_seg == abs_seg
        || ((spec_seg == "*" || spec_seg == INSTANCE_PLACEHOLDER)
            && abs_seg.chars().all(|c| c.is_ascii_digit()))
}

fn segments_match_exact(absolute: &str, spec: &str) -> bool {
    let abs: Vec<&str> = absolute.trim_end_matches('.').split('.').collect();
    let spec: Vec<&str> = spec.split('.').collect();
    abs.len() == spec.len()
        && abs
            .iter()
            .zip(spec.iter())
            .all(|(a, s)| segment_matches(a, s))
}

fn segments_match_prefix(absolute: &str, spec: &str) -> bool {
    let abs: Vec<&str> = absolute.trim_end_matches('.').split('.').collect();
    let spec: Vec<&str> = spec.split('.').collect();
    abs.len() >= spec.len()
        && spec
            .iter()
            .zip(abs.iter())
            .all(|(s, a)| segment_matches(a, s))
}

/// Compares the tail of a full parameter path against a bare parameter
/// name, used when propagating per-parameter errors from a response back
/// into the caller's parameter array.
pub fn tail_matches(full_path: &str, param_name: &str) -> bool {
    full_path == param_name || full_path.ends_with(&format!(".{}", param_name))
}

/// Ensures the path carries a trailing dot.
pub fn with_trailing_dot(path: &str) -> String {
    if path.ends_with('.') {
        path.to_string()
    } else {
        format!("{}.", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_path_validation() {
        assert!(validate_register_path("Device.WiFi.").is_ok());
        assert!(validate_register_path("Device.X.Y.").is_ok());

        // Must start with Device.
        assert_eq!(
            validate_register_path("Dev.WiFi."),
            Err(UspError::RegisterFailure)
        );
        // Must end with a dot
        assert_eq!(
            validate_register_path("Device.WiFi"),
            Err(UspError::RegisterFailure)
        );
        // No placeholders
        assert_eq!(
            validate_register_path("Device.WiFi.{i}."),
            Err(UspError::RegisterFailure)
        );
        // No instance numbers
        assert_eq!(
            validate_register_path("Device.WiFi.1."),
            Err(UspError::RegisterFailure)
        );
        // Only alphanumerics and dots
        assert_eq!(
            validate_register_path("Device.Wi-Fi."),
            Err(UspError::RegisterFailure)
        );
    }

    #[test]
    fn schema_path_strips_instance_numbers() {
        assert_eq!(to_schema_path("Device.X.Z.5.Y"), "Device.X.Z.{i}.Y");
        assert_eq!(to_schema_path("Device.X.Z.5."), "Device.X.Z.{i}.");
        assert_eq!(to_schema_path("Device.X.Y"), "Device.X.Y");
    }

    #[test]
    fn trailing_instance() {
        assert_eq!(trailing_instance_number("Device.X.Z.5."), Some(5));
        assert_eq!(trailing_instance_number("Device.X.Z.5"), Some(5));
        assert_eq!(trailing_instance_number("Device.X.Z."), None);
    }

    #[test]
    fn path_matching() {
        assert!(is_path_match("Device.X.Run()", "Device.X.Run()"));
        assert!(is_path_match("Device.X.Y", "Device.X."));
        assert!(is_path_match("Device.X.Z.3.Y", "Device.X.Z.*.Y"));
        assert!(!is_path_match("Device.X.Y", "Device.Other."));
        assert!(!is_path_match("Device.X.Y", "Device.X.Z"));
    }

    #[test]
    fn tail_match() {
        assert!(tail_matches("Device.LocalAgent.Subscription.ID", "ID"));
        assert!(tail_matches("Enable", "Enable"));
        assert!(!tail_matches("Device.X.NotifType", "Type"));
    }
}
