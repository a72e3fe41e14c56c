//! Shared utilities for CBT.

use chrono::{DateTime, SecondsFormat, Utc};

/// ISO-8601 UTC timestamp with millisecond precision, e.g.
/// `2024-03-01T12:00:00.125Z`.
pub fn format_timestamp_millis(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Serde adapter for [`format_timestamp_millis`] timestamps.
pub mod millis_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp_millis(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

fn find_value_end(s: &str) -> usize {
    let mut chars = s.chars();
    let mut end = 0;
    let mut in_quote = None;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        let char_len = c.len_utf8();

        if escaped {
            escaped = false;
            end += char_len;
            continue;
        }

        if c == '\\' {
            escaped = true;
            end += char_len;
            continue;
        }

        if let Some(q) = in_quote {
            if c == q {
                in_quote = None;
            }
            end += char_len;
            continue;
        }

        if c == '"' || c == '\'' {
            in_quote = Some(c);
            end += char_len;
            continue;
        }

        if c.is_whitespace() {
            break;
        }

        end += char_len;
    }
    end
}

/// Mask credential values in a command line or environment dump before
/// logging it.
pub fn mask_sensitive_command(cmd: &str) -> String {
    let patterns = [
        ("CBT_RUNNER_KEY=", "CBT_RUNNER_KEY=***"),
        ("RUNNER_KEY=", "RUNNER_KEY=***"),
        ("PASSWORD=", "PASSWORD=***"),
        ("TOKEN=", "TOKEN=***"),
        ("--runner-key ", "--runner-key ***"),
        ("--runner-key=", "--runner-key=***"),
        ("--password ", "--password ***"),
        ("--password=", "--password=***"),
        ("--token ", "--token ***"),
        ("--token=", "--token=***"),
    ];

    let mut result = cmd.to_string();
    for (pattern, replacement) in patterns {
        // Resume after each replacement; the replacement contains the pattern.
        let mut search_start = 0;
        while search_start < result.len() {
            let Some(start) = result[search_start..].find(pattern) else {
                break;
            };
            let abs_start = search_start + start;
            let value_start = abs_start + pattern.len();
            let rest = &result[value_start..];
            if rest.starts_with("***") {
                search_start = value_start;
                continue;
            }
            let value_end = value_start + find_value_end(rest);

            let prefix = &result[..abs_start];
            let suffix = &result[value_end..];
            result = format!("{}{}{}", prefix, replacement, suffix);

            search_start = abs_start + replacement.len();
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_has_millisecond_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap()
            + chrono::Duration::microseconds(125_400);
        assert_eq!(format_timestamp_millis(&ts), "2024-03-01T12:00:05.125Z");
    }

    #[test]
    fn test_mask_runner_key() {
        let cmd = "env CBT_RUNNER_KEY=hunter2 ./test_basic --token abc";
        let masked = mask_sensitive_command(cmd);
        assert_eq!(masked, "env CBT_RUNNER_KEY=*** ./test_basic --token ***");
    }

    #[test]
    fn test_mask_multiple_and_quoted() {
        assert_eq!(
            mask_sensitive_command("TOKEN=a TOKEN=b"),
            "TOKEN=*** TOKEN=***"
        );
        let masked = mask_sensitive_command("run PASSWORD=\"two words\" --other");
        assert_eq!(masked, "run PASSWORD=*** --other");
    }

    #[test]
    fn test_mask_leaves_plain_commands_alone() {
        let cmd = "git checkout deadbeef";
        assert_eq!(mask_sensitive_command(cmd), cmd);
    }
}
