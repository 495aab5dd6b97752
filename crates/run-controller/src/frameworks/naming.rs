use lazy_static::lazy_static;
use regex::Regex;

use crate::model::Runnable;

const MAX_K8S_NAME_LENGTH: usize = 63;

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^a-z0-9-]+").expect("valid pattern");
    static ref INVALID_LABEL_CHARS: Regex =
        Regex::new(r"[^A-Za-z0-9_.-]+").expect("valid pattern");
}

pub struct ResourceNaming;

impl ResourceNaming {
    /// `<prefix>-<runtime><task>-<id>`, DNS-1123 safe.
    pub fn resource_name(prefix: &str, runnable: &Runnable) -> String {
        Self::sanitize(&format!(
            "{prefix}-{}{}-{}",
            runnable.runtime, runnable.task, runnable.id
        ))
    }

    pub fn job_name(runnable: &Runnable) -> String {
        Self::resource_name("j", runnable)
    }

    pub fn cron_job_name(runnable: &Runnable) -> String {
        Self::resource_name("c", runnable)
    }

    pub fn deployment_name(runnable: &Runnable) -> String {
        Self::resource_name("d", runnable)
    }

    pub fn service_name(runnable: &Runnable) -> String {
        Self::resource_name("s", runnable)
    }

    pub fn build_job_name(runnable: &Runnable) -> String {
        Self::resource_name("b", runnable)
    }

    pub fn custom_resource_name(runnable: &Runnable) -> String {
        Self::resource_name("cr", runnable)
    }

    /// Companion secret holding the runnable's credentials.
    pub fn run_secret_name(id: &str) -> String {
        Self::sanitize(&format!("sec-run-{id}"))
    }

    pub fn init_config_map_name(id: &str) -> String {
        Self::sanitize(&format!("init-config-map-{id}"))
    }

    /// Lowercase, `[a-z0-9-]` only, at most 63 characters, alphanumeric at both ends.
    pub fn sanitize(raw: &str) -> String {
        let lowered = raw.to_lowercase();
        let replaced = INVALID_NAME_CHARS.replace_all(&lowered, "-");
        let trimmed = replaced.trim_matches('-');
        let truncated: String = trimmed.chars().take(MAX_K8S_NAME_LENGTH).collect();
        truncated.trim_end_matches('-').to_string()
    }

    /// Label values allow mixed case, `_` and `.` but are still capped at 63.
    pub fn label_value(raw: &str) -> String {
        let replaced = INVALID_LABEL_CHARS.replace_all(raw, "-");
        let truncated: String = replaced.chars().take(MAX_K8S_NAME_LENGTH).collect();
        truncated
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_string()
    }

    /// Environment variable name for a secret key.
    pub fn env_name(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runnable(id: &str) -> Runnable {
        Runnable {
            id: id.into(),
            runtime: "container".into(),
            task: "job".into(),
            ..Runnable::default()
        }
    }

    #[test]
    fn names_follow_prefix_convention() {
        let r = runnable("abc123");
        assert_eq!(ResourceNaming::job_name(&r), "j-containerjob-abc123");
        assert_eq!(ResourceNaming::deployment_name(&r), "d-containerjob-abc123");
        assert_eq!(ResourceNaming::service_name(&r), "s-containerjob-abc123");
        assert_eq!(ResourceNaming::run_secret_name("abc123"), "sec-run-abc123");
        assert_eq!(
            ResourceNaming::init_config_map_name("abc123"),
            "init-config-map-abc123"
        );
    }

    #[test]
    fn names_are_dns_safe() {
        let r = runnable("ABC_123.x");
        assert_eq!(ResourceNaming::job_name(&r), "j-containerjob-abc-123-x");

        let long = runnable(&"a".repeat(100));
        let name = ResourceNaming::job_name(&long);
        assert_eq!(name.len(), 63);
        assert!(name.starts_with("j-containerjob-"));
    }

    #[test]
    fn truncation_never_ends_with_dash() {
        let raw = format!("{}-{}", "a".repeat(62), "b");
        assert_eq!(ResourceNaming::sanitize(&raw), "a".repeat(62));
    }

    #[test]
    fn label_values_and_env_names() {
        assert_eq!(ResourceNaming::label_value("my project!"), "my-project");
        assert_eq!(ResourceNaming::env_name("db.password"), "DB_PASSWORD");
    }
}
