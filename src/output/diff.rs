//! Prefix-based text reconciliation
//!
//! Live transcripts change at the tail: words get appended, and the last
//! few words get revised. Comparing only the common prefix is O(n) and
//! gives the corrections a listener expects. Revisions in the middle of
//! the text are retyped from the first differing character.
//!
//! Lengths are in characters, since each one is a backspace.

use serde::Serialize;

/// Edit turning previously emitted text into new text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextDiff {
    /// Type `text` after what is already there
    Append { text: String },
    /// Erase everything
    DeleteAll { chars_to_delete: usize },
    /// Erase the trailing `chars_to_delete` characters
    DeleteSuffix { chars_to_delete: usize },
    /// Erase the diverging tail, then type `text`
    ReplaceSuffix { chars_to_delete: usize, text: String },
    /// Nothing in common; erase everything, then type `text`
    ReplaceAll { chars_to_delete: usize, text: String },
}

impl TextDiff {
    pub fn chars_to_delete(&self) -> usize {
        match self {
            TextDiff::Append { .. } => 0,
            TextDiff::DeleteAll { chars_to_delete }
            | TextDiff::DeleteSuffix { chars_to_delete }
            | TextDiff::ReplaceSuffix { chars_to_delete, .. }
            | TextDiff::ReplaceAll { chars_to_delete, .. } => *chars_to_delete,
        }
    }

    pub fn text_to_insert(&self) -> &str {
        match self {
            TextDiff::Append { text }
            | TextDiff::ReplaceSuffix { text, .. }
            | TextDiff::ReplaceAll { text, .. } => text,
            TextDiff::DeleteAll { .. } | TextDiff::DeleteSuffix { .. } => "",
        }
    }

    /// Short description for logs and results
    pub fn describe(&self) -> String {
        let preview = |text: &str| text.chars().take(30).collect::<String>();
        match self {
            TextDiff::Append { text } => format!("Appending: '{}'", preview(text)),
            TextDiff::DeleteAll { chars_to_delete } => {
                format!("Deleting all {} characters", chars_to_delete)
            }
            TextDiff::DeleteSuffix { chars_to_delete } => {
                format!("Deleting {} suffix characters", chars_to_delete)
            }
            TextDiff::ReplaceSuffix {
                chars_to_delete,
                text,
            }
            | TextDiff::ReplaceAll {
                chars_to_delete,
                text,
            } => format!(
                "Replacing: deleting {} chars, typing '{}'",
                chars_to_delete,
                preview(text)
            ),
        }
    }
}

/// Compute the edit from `old` to `new`
pub fn get_text_diff(old: &str, new: &str) -> TextDiff {
    if old.is_empty() {
        return TextDiff::Append {
            text: new.to_string(),
        };
    }

    let old_len = old.chars().count();
    if new.is_empty() {
        return TextDiff::DeleteAll {
            chars_to_delete: old_len,
        };
    }

    // Matching characters have equal UTF-8 width, so the byte offset is shared.
    let mut prefix_chars = 0;
    let mut prefix_bytes = 0;
    for (a, b) in old.chars().zip(new.chars()) {
        if a != b {
            break;
        }
        prefix_chars += 1;
        prefix_bytes += a.len_utf8();
    }

    let new_len = new.chars().count();
    if prefix_chars == old_len {
        TextDiff::Append {
            text: new[prefix_bytes..].to_string(),
        }
    } else if prefix_chars == new_len {
        TextDiff::DeleteSuffix {
            chars_to_delete: old_len - prefix_chars,
        }
    } else if prefix_chars == 0 {
        TextDiff::ReplaceAll {
            chars_to_delete: old_len,
            text: new.to_string(),
        }
    } else {
        TextDiff::ReplaceSuffix {
            chars_to_delete: old_len - prefix_chars,
            text: new[prefix_bytes..].to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_when_old_empty() {
        assert_eq!(
            get_text_diff("", "Hello"),
            TextDiff::Append {
                text: "Hello".into()
            }
        );
    }

    #[test]
    fn test_delete_all_when_new_empty() {
        assert_eq!(
            get_text_diff("Hello", ""),
            TextDiff::DeleteAll { chars_to_delete: 5 }
        );
    }

    #[test]
    fn test_append_suffix() {
        assert_eq!(
            get_text_diff("Hello wor", "Hello world"),
            TextDiff::Append { text: "ld".into() }
        );
    }

    #[test]
    fn test_delete_suffix() {
        assert_eq!(
            get_text_diff("Hello world", "Hello"),
            TextDiff::DeleteSuffix { chars_to_delete: 6 }
        );
    }

    #[test]
    fn test_replace_suffix() {
        assert_eq!(
            get_text_diff("Hello world", "Hello there"),
            TextDiff::ReplaceSuffix {
                chars_to_delete: 5,
                text: "there".into()
            }
        );
    }

    #[test]
    fn test_replace_all() {
        assert_eq!(
            get_text_diff("cat", "dog"),
            TextDiff::ReplaceAll {
                chars_to_delete: 3,
                text: "dog".into()
            }
        );
    }

    #[test]
    fn test_identical_text_appends_nothing() {
        assert_eq!(
            get_text_diff("same", "same"),
            TextDiff::Append { text: String::new() }
        );
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        let diff = get_text_diff("café au lait", "café noir");
        assert_eq!(
            diff,
            TextDiff::ReplaceSuffix {
                chars_to_delete: 7,
                text: "noir".into()
            }
        );
        assert_eq!(
            get_text_diff("naïve", "na"),
            TextDiff::DeleteSuffix { chars_to_delete: 3 }
        );
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let json = serde_json::to_value(get_text_diff("Hello wor", "Hello world")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "append", "text": "ld"}));

        let json = serde_json::to_value(get_text_diff("abc", "")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "delete_all", "chars_to_delete": 3})
        );
    }

    #[test]
    fn test_accessors() {
        let diff = get_text_diff("Hello world", "Hello there");
        assert_eq!(diff.chars_to_delete(), 5);
        assert_eq!(diff.text_to_insert(), "there");
        assert!(diff.describe().starts_with("Replacing"));
    }
}
