use chrono::Utc;

use crate::config::TaggingConfig;
use crate::jobs::JobEvent;

/// Derive the normalized tag set for an execution: the job's own declared
/// tags first, then the configured automatic tags, then cleanup. Returns
/// None when tagging is off or nothing survives normalization.
pub fn extract_tags(
    event: &JobEvent,
    declared: &[String],
    config: &TaggingConfig,
    environment: &str,
) -> Option<Vec<String>> {
    if !config.enabled {
        return None;
    }

    let mut tags: Vec<String> = declared.to_vec();

    if config.auto_queue_name {
        tags.push(format!("queue:{}", event.queue_name()));
    }
    if config.auto_environment {
        tags.push(format!("env:{environment}"));
    }
    if config.auto_hour {
        tags.push(format!("hour:{}", Utc::now().format("%H")));
    }

    let cleaned = normalize_tags(tags, config.max_tags_per_job);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Trim, lowercase, drop empties, dedupe preserving first-seen order, cap.
pub fn normalize_tags(tags: Vec<String>, max_tags: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut cleaned = Vec::new();

    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            continue;
        }
        if seen.insert(tag.clone()) {
            cleaned.push(tag);
            if cleaned.len() == max_tags {
                break;
            }
        }
    }

    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn event(queue: &str) -> JobEvent {
        JobEvent {
            uuid: Some("u1".into()),
            job_id: None,
            job_class: "EmailJob".into(),
            queue: Some(queue.into()),
            connection: None,
            attempt: 1,
            payload: Value::Null,
            released: false,
        }
    }

    #[test]
    fn normalization_trims_lowercases_dedupes_in_order() {
        let input = vec![
            "Email".to_string(),
            "email".to_string(),
            " URGENT ".to_string(),
            "".to_string(),
            "email".to_string(),
        ];
        assert_eq!(normalize_tags(input, 20), vec!["email", "urgent"]);
    }

    #[test]
    fn cap_keeps_first_seen() {
        let input = (0..30).map(|i| format!("t{i}")).collect::<Vec<_>>();
        let cleaned = normalize_tags(input, 20);
        assert_eq!(cleaned.len(), 20);
        assert_eq!(cleaned[0], "t0");
        assert_eq!(cleaned[19], "t19");
    }

    #[test]
    fn queue_auto_tag_is_appended_after_declared_tags() {
        let config = TaggingConfig {
            enabled: true,
            auto_queue_name: true,
            auto_environment: false,
            auto_hour: false,
            max_tags_per_job: 20,
        };
        let tags = extract_tags(&event("mail"), &["Billing".to_string()], &config, "production")
            .expect("tags");
        assert_eq!(tags, vec!["billing", "queue:mail"]);
    }

    #[test]
    fn disabled_tagging_yields_none() {
        let config = TaggingConfig {
            enabled: false,
            auto_queue_name: true,
            auto_environment: true,
            auto_hour: true,
            max_tags_per_job: 20,
        };
        assert!(extract_tags(&event("mail"), &[], &config, "production").is_none());
    }

    #[test]
    fn environment_tag_obeys_toggle() {
        let config = TaggingConfig {
            enabled: true,
            auto_queue_name: false,
            auto_environment: true,
            auto_hour: false,
            max_tags_per_job: 20,
        };
        let tags = extract_tags(&event("mail"), &[], &config, "staging").expect("tags");
        assert_eq!(tags, vec!["env:staging"]);
    }
}
