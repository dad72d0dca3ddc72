//! AI-attribution detection from commit metadata.
//!
//! A commit is attributed to an AI tool when one of its `Co-Authored-By:`
//! trailers matches a configured rule, or when its message carries one of the
//! configured free-text markers. Anything else is treated as human-authored.

use crate::config::{AttributionConfig, MarkerRule, TrailerRule};

const CO_AUTHOR_KEY: &str = "co-authored-by";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub tool: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoAuthor {
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AttributionDetector {
    rules: Vec<TrailerRule>,
    markers: Vec<MarkerRule>,
}

impl AttributionDetector {
    pub fn new(config: &AttributionConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .filter(|rule| !rule.pattern.trim().is_empty())
            .map(|rule| TrailerRule {
                pattern: rule.pattern.trim().to_ascii_lowercase(),
                tool: rule.tool.clone(),
                model: rule.model.clone(),
            })
            .collect();
        let markers = config
            .markers
            .iter()
            .filter(|marker| !marker.pattern.trim().is_empty())
            .map(|marker| MarkerRule {
                pattern: marker.pattern.trim().to_ascii_lowercase(),
                tool: marker.tool.clone(),
            })
            .collect();
        Self { rules, markers }
    }

    pub fn detect(&self, message: &str) -> Option<Attribution> {
        for co_author in co_author_trailers(message) {
            let name = co_author.name.to_ascii_lowercase();
            let email = co_author
                .email
                .as_deref()
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();
            let matched = self
                .rules
                .iter()
                .find(|rule| name.contains(&rule.pattern) || email.contains(&rule.pattern));
            if let Some(rule) = matched {
                return Some(Attribution {
                    tool: rule.tool.clone(),
                    model: rule.model.clone().or_else(|| model_from_name(&co_author.name)),
                });
            }
        }

        let lowered = message.to_ascii_lowercase();
        self.markers
            .iter()
            .find(|marker| lowered.contains(&marker.pattern))
            .map(|marker| Attribution {
                tool: marker.tool.clone(),
                model: None,
            })
    }
}

/// Parses every `Co-Authored-By: Name <email>` line of a commit message.
pub fn co_author_trailers(message: &str) -> Vec<CoAuthor> {
    message
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once(':')?;
            if !key.trim().eq_ignore_ascii_case(CO_AUTHOR_KEY) {
                return None;
            }
            parse_co_author(value.trim())
        })
        .collect()
}

fn parse_co_author(value: &str) -> Option<CoAuthor> {
    if value.is_empty() {
        return None;
    }
    match value.split_once('<') {
        Some((name, rest)) => {
            let email = rest.split_once('>').map(|(email, _)| email).unwrap_or(rest);
            let email = email.trim();
            Some(CoAuthor {
                name: name.trim().to_string(),
                email: (!email.is_empty()).then(|| email.to_string()),
            })
        }
        None => Some(CoAuthor {
            name: value.to_string(),
            email: None,
        }),
    }
}

/// Derives a model slug from a versioned co-author name such as
/// `Claude Opus 4.5`. Names without a version number carry no model.
fn model_from_name(name: &str) -> Option<String> {
    if !name.chars().any(|ch| ch.is_ascii_digit()) {
        return None;
    }
    let slug = name
        .split_whitespace()
        .map(|word| word.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("-");
    (!slug.is_empty()).then_some(slug)
}
