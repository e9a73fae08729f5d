use chrono::NaiveDateTime;
use serde::Deserialize;

/// How a prepared prompt is decorated before it goes downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    #[default]
    None,
    /// Millisecond local time, prefixed.
    Time,
    /// Second-resolution local time, with the content labelled as the query.
    Timestamp,
}

pub fn decorate(style: PromptStyle, content: &str, now: NaiveDateTime) -> String {
    match style {
        PromptStyle::None => content.to_string(),
        PromptStyle::Time => format!(
            "Current time: {}. {content}",
            now.format("%Y-%m-%d %H:%M:%S%.3f")
        ),
        PromptStyle::Timestamp => format!(
            "Current time: {}.  Original query: {content}",
            now.format("%Y-%m-%d %H:%M:%S")
        ),
    }
}
