//! Model identifier canonicalization shared by the usage adapters.

/// Sentinel used when a provider reports no specific model.
pub const DEFAULT_MODEL: &str = "default";

const VARIANT_SUFFIXES: &[(&str, &str)] = &[
    ("-high-thinking", "high-thinking"),
    ("-thinking", "thinking"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalModel {
    pub base: String,
    pub variant: Option<String>,
}

pub fn canonicalize_model(raw: &str) -> CanonicalModel {
    let lowered = raw.trim().to_ascii_lowercase();
    let mut name = match lowered.rsplit_once('/') {
        Some((_, tail)) => tail.to_string(),
        None => lowered,
    };

    if is_default_alias(&name) {
        return CanonicalModel {
            base: DEFAULT_MODEL.to_string(),
            variant: None,
        };
    }

    name = strip_date_suffix(&name).to_string();
    let mut variant = None;
    for (suffix, label) in VARIANT_SUFFIXES {
        if let Some(stripped) = name.strip_suffix(suffix) {
            variant = Some((*label).to_string());
            name = stripped.to_string();
            break;
        }
    }
    name = strip_date_suffix(&name).to_string();

    if name.is_empty() {
        name = DEFAULT_MODEL.to_string();
    }

    CanonicalModel {
        base: name,
        variant,
    }
}

fn is_default_alias(name: &str) -> bool {
    matches!(name, "" | "default" | "auto")
}

/// Strips `-YYYYMMDD`, `-YYYY-MM-DD` and `@YYYYMMDD` release suffixes.
fn strip_date_suffix(name: &str) -> &str {
    if let Some((head, tail)) = name.rsplit_once('@') {
        if is_compact_date(tail) {
            return head;
        }
    }
    if name.len() > 11 && name.is_char_boundary(name.len() - 11) {
        let (head, tail) = name.split_at(name.len() - 11);
        if let Some(date) = tail.strip_prefix('-') {
            if is_dashed_date(date) {
                return head;
            }
        }
    }
    if let Some((head, tail)) = name.rsplit_once('-') {
        if is_compact_date(tail) {
            return head;
        }
    }
    name
}

fn is_compact_date(value: &str) -> bool {
    value.len() == 8 && value.starts_with("20") && value.bytes().all(|b| b.is_ascii_digit())
}

fn is_dashed_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(idx, b)| idx == 4 || idx == 7 || b.is_ascii_digit())
}
