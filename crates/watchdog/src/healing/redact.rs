//! Secret redaction for log text leaving the cluster (issues, remediation briefs).

use regex::Regex;
use std::borrow::Cow;

/// Patterns for common secret formats
const SECRET_PATTERNS: &[(&str, &str)] = &[
    // API keys with known prefixes
    (r"sk-ant-[a-zA-Z0-9_-]+", "[REDACTED_ANTHROPIC_KEY]"),
    (r"sk-proj-[a-zA-Z0-9_-]+", "[REDACTED_OPENAI_KEY]"),
    (r"ghp_[a-zA-Z0-9]{20,}", "[REDACTED_GITHUB_TOKEN]"),
    (r"ghs_[a-zA-Z0-9]{20,}", "[REDACTED_GITHUB_TOKEN]"),
    (r"github_pat_[a-zA-Z0-9_]+", "[REDACTED_GITHUB_TOKEN]"),
    (r"xai-[a-zA-Z0-9]+", "[REDACTED_XAI_KEY]"),
    (r"AIzaSy[a-zA-Z0-9_-]+", "[REDACTED_GOOGLE_KEY]"),
    // KEY=value and "KEY":"value" forms for anything named like a secret
    (
        r#"(?i)"([A-Z0-9_]*(?:API_KEY|TOKEN|SECRET|PASSWORD))"\s*:\s*"[^"]+""#,
        r#""$1":"[REDACTED]""#,
    ),
    (
        r"(?i)\b([A-Z0-9_]*(?:API_KEY|TOKEN|SECRET|PASSWORD))=\S+",
        "$1=[REDACTED]",
    ),
    // OpenBao/secrets raw output blocks (entire _raw JSON)
    (r"_raw=\{[^}]+\}", "_raw={[REDACTED_SECRETS_DATA]}"),
];

/// Redact sensitive information from logs to prevent secret leakage
pub fn redact_secrets(text: &str) -> String {
    let mut result = Cow::Borrowed(text);

    for (pattern, replacement) in SECRET_PATTERNS {
        if let Ok(re) = Regex::new(pattern) {
            if re.is_match(&result) {
                result = Cow::Owned(re.replace_all(&result, *replacement).into_owned());
            }
        }
    }

    result.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_prefixed_keys() {
        let out = redact_secrets("using key sk-ant-abc123_XYZ for request");
        assert_eq!(out, "using key [REDACTED_ANTHROPIC_KEY] for request");
    }

    #[test]
    fn test_redacts_json_and_env_forms() {
        let out = redact_secrets(r#"{"OPENAI_API_KEY":"abc","other":"keep"}"#);
        assert_eq!(out, r#"{"OPENAI_API_KEY":"[REDACTED]","other":"keep"}"#);

        let out = redact_secrets("export GITHUB_TOKEN=abcdef done");
        assert_eq!(out, "export GITHUB_TOKEN=[REDACTED] done");
    }

    #[test]
    fn test_plain_text_untouched() {
        let line = "error: container exited with code 137";
        assert_eq!(redact_secrets(line), line);
    }
}
