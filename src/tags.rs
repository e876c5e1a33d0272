//! Tag normalization and formatting for the tag field.
//!
//! The model answers with a comma-separated list ("blue eyes, smile"); tag
//! fields hold whitespace-separated tokens in underscore form
//! ("blue_eyes smile"). Everything here is pure and never fails: malformed
//! input degrades to fewer tags, not to an error.

use crate::config::{Config, SortingMode};
use std::collections::{BTreeMap, HashSet};

/// Canonical form of a tag: lower-cased, trimmed, every run of whitespace
/// and underscores collapsed to a single underscore.
pub fn normalize(tag: &str) -> String {
    let lowered = tag.trim().to_lowercase();
    let mut normalized = String::with_capacity(lowered.len());
    let mut in_separator = false;

    for c in lowered.chars() {
        if c.is_whitespace() || c == '_' {
            if !in_separator {
                normalized.push('_');
            }
            in_separator = true;
        } else {
            normalized.push(c);
            in_separator = false;
        }
    }

    normalized
}

/// Normalized entries of a comma-separated tag list
pub fn parse_tag_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(normalize)
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Split a tag field into its whitespace-separated tokens
pub fn split_field(field: &str) -> Vec<&str> {
    field.split_whitespace().collect()
}

/// Turn raw model output into the final tag field text.
///
/// New tags are filtered through the blacklist and written in normalized
/// form. With `preserve_existing_tags` set, the tokens already in `existing`
/// are kept verbatim and come first in the union. Duplicates are detected by
/// normalized form.
pub fn format_tags(raw: &str, existing: &str, config: &Config) -> String {
    let blacklist: HashSet<String> = parse_tag_list(&config.tag_blacklist).into_iter().collect();

    let new_tags = raw
        .split(',')
        .map(normalize)
        .filter(|tag| !tag.is_empty() && !blacklist.contains(tag));

    let kept: Vec<String> = if config.preserve_existing_tags {
        split_field(existing).into_iter().map(str::to_string).collect()
    } else {
        Vec::new()
    };

    let mut seen = HashSet::new();
    let mut tags: Vec<String> = kept
        .into_iter()
        .chain(new_tags)
        .filter(|tag| seen.insert(normalize(tag)))
        .collect();

    tags.sort_by_cached_key(|tag| (tag.to_lowercase(), tag.clone()));

    render(&tags, config.sorting_mode)
}

/// Re-run the field through blacklist, dedup, sort and layout.
pub fn reformat(field: &str, config: &Config) -> String {
    let as_list = split_field(field).join(",");
    let config = Config {
        preserve_existing_tags: false,
        ..config.clone()
    };
    format_tags(&as_list, "", &config)
}

/// Which kind of page the tag field belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageKind {
    #[default]
    Upload,
    /// An existing post's edit form
    Edit,
}

impl PageKind {
    pub fn from_url(url: &str) -> Self {
        if url.contains("/posts/") && !url.contains("/uploads/new") {
            PageKind::Edit
        } else {
            PageKind::Upload
        }
    }
}

/// Field text after applying the configured constant tags.
///
/// Returns `None` when there is nothing to apply: no constant tags are
/// configured, or this is an edit page and `enable_auto_tag_on_edit` is off.
pub fn constant_tags(field: &str, config: &Config, page: PageKind) -> Option<String> {
    if config.constant_tags.trim().is_empty() {
        return None;
    }
    if page == PageKind::Edit && !config.enable_auto_tag_on_edit {
        return None;
    }
    Some(format_tags(&config.constant_tags, field, config))
}

fn render(tags: &[String], mode: SortingMode) -> String {
    match mode {
        SortingMode::Flat => tags.join(" "),
        SortingMode::OnePerLine => tags.join("\n"),
        SortingMode::Grouped => {
            let mut groups: BTreeMap<String, Vec<&str>> = BTreeMap::new();
            for tag in tags {
                let first: String = tag.chars().next().into_iter().flat_map(char::to_lowercase).collect();
                groups.entry(first).or_default().push(tag);
            }
            groups
                .values()
                .map(|group| group.join(" "))
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(mode: SortingMode, blacklist: &str) -> Config {
        Config {
            sorting_mode: mode,
            tag_blacklist: blacklist.to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Blue Eyes "), "blue_eyes");
        assert_eq!(normalize("red__eyes"), "red_eyes");
        assert_eq!(normalize("long   tail\tfur"), "long_tail_fur");
        assert_eq!(normalize("solo"), "solo");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_normalize_idempotent() {
        let samples = [
            "Blue Eyes",
            "red__eyes",
            "a _b",
            "  MIXED_case  tag ",
            "___",
            "Über Größe",
            "tab\tand  space",
            "",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "normalize not idempotent for {:?}", sample);
        }
    }

    #[test]
    fn test_duplicate_forms_collapse() {
        let config = config_with(SortingMode::Flat, "");
        assert_eq!(
            format_tags("blue eyes, RED_EYES, red eyes", "", &config),
            "blue_eyes red_eyes"
        );
    }

    #[test]
    fn test_blacklist_matches_normalized_form() {
        let config = config_with(SortingMode::Flat, "blue eyes");
        assert_eq!(format_tags("blue_eyes, red eyes", "", &config), "red_eyes");

        let config = config_with(SortingMode::Flat, " Solo , ,MALE");
        assert_eq!(format_tags("solo, male, fur", "", &config), "fur");
    }

    #[test]
    fn test_grouped_layout() {
        let config = config_with(SortingMode::Grouped, "");
        assert_eq!(
            format_tags("banana, apple, cherry", "", &config),
            "apple\nbanana\ncherry"
        );
        assert_eq!(
            format_tags("blue_eyes, anthro, black_nose, canine", "", &config),
            "anthro\nblack_nose blue_eyes\ncanine"
        );
    }

    #[test]
    fn test_one_per_line_layout() {
        let config = config_with(SortingMode::OnePerLine, "");
        assert_eq!(format_tags("smile, fur, anthro", "", &config), "anthro\nfur\nsmile");
    }

    #[test]
    fn test_sort_is_case_insensitive() {
        let config = Config {
            preserve_existing_tags: true,
            ..Config::default()
        };
        assert_eq!(format_tags("apple", "Banana cherry", &config), "apple Banana cherry");
    }

    #[test]
    fn test_existing_ignored_unless_preserving() {
        let config = Config::default();
        assert_eq!(format_tags("fur", "old_tag", &config), "fur");
    }

    #[test]
    fn test_preserve_unions_with_existing() {
        let config = Config {
            preserve_existing_tags: true,
            ..Config::default()
        };
        assert_eq!(
            format_tags("smile, blue eyes", "rating:s\nblue_eyes  Zebra", &config),
            "blue_eyes rating:s smile Zebra"
        );
    }

    #[test]
    fn test_preserve_keeps_existing_spelling() {
        let config = Config {
            preserve_existing_tags: true,
            ..Config::default()
        };
        assert_eq!(format_tags("blue eyes", "Blue_Eyes", &config), "Blue_Eyes");
    }

    #[test]
    fn test_empty_input() {
        let config = Config::default();
        assert_eq!(format_tags("", "", &config), "");
        assert_eq!(format_tags(" , ,, ", "", &config), "");
    }

    #[test]
    fn test_reformat_field() {
        let config = config_with(SortingMode::Flat, "watermark");
        assert_eq!(
            reformat("smile  watermark\nAnthro smile", &config),
            "anthro smile"
        );
    }

    #[test]
    fn test_page_kind_from_url() {
        assert_eq!(PageKind::from_url("https://e621.net/uploads/new"), PageKind::Upload);
        assert_eq!(PageKind::from_url("https://e621.net/posts/12345"), PageKind::Edit);
        assert_eq!(
            PageKind::from_url("https://e621.net/posts/uploads/new"),
            PageKind::Upload
        );
    }

    #[test]
    fn test_constant_tags() {
        let config = Config {
            constant_tags: "digital media (artwork), hi res".to_string(),
            ..Config::default()
        };
        assert_eq!(
            constant_tags("", &config, PageKind::Upload).as_deref(),
            Some("digital_media_(artwork) hi_res")
        );
        assert_eq!(constant_tags("", &config, PageKind::Edit), None);

        let on_edit = Config {
            enable_auto_tag_on_edit: true,
            preserve_existing_tags: true,
            ..config
        };
        assert_eq!(
            constant_tags("solo", &on_edit, PageKind::Edit).as_deref(),
            Some("digital_media_(artwork) hi_res solo")
        );
    }

    #[test]
    fn test_no_constant_tags_configured() {
        assert_eq!(constant_tags("solo", &Config::default(), PageKind::Upload), None);
    }
}
