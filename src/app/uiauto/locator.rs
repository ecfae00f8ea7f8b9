use serde::{Deserialize, Serialize};
use std::fmt;

/// Abstract reference to an on-screen element, matched against nodes of a
/// UI hierarchy dump. Kept serializable so locator tables (popup dismiss
/// lists, navigation fallbacks) are configuration data rather than code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum Locator {
    /// Resource id, with or without the `package:id/` prefix.
    Id(String),
    /// Exact (trimmed) visible text.
    Text(String),
    /// Exact (trimmed) content description.
    Desc(String),
}

impl Locator {
    pub fn matches(&self, node: &UiNode) -> bool {
        match self {
            Locator::Id(id) => {
                let actual = node.resource_id.trim();
                actual == id
                    || actual
                        .rsplit_once(":id/")
                        .map(|(_, suffix)| suffix == id)
                        .unwrap_or(false)
            }
            Locator::Text(text) => node.text.trim() == text,
            Locator::Desc(desc) => node.content_desc.trim() == desc,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Id(id) => write!(f, "id={id}"),
            Locator::Text(text) => write!(f, "text={text}"),
            Locator::Desc(desc) => write!(f, "desc={desc}"),
        }
    }
}

/// One `<node>` of a `uiautomator dump` hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiNode {
    pub resource_id: String,
    pub text: String,
    pub content_desc: String,
    pub class: String,
    pub bounds: Option<(i32, i32, i32, i32)>,
}

impl UiNode {
    pub fn center(&self) -> Option<(i32, i32)> {
        self.bounds
            .map(|(left, top, right, bottom)| ((left + right) / 2, (top + bottom) / 2))
    }
}

/// Parses the `[left,top][right,bottom]` bounds attribute form.
pub fn parse_bounds(value: &str) -> Option<(i32, i32, i32, i32)> {
    let trimmed = value.trim();
    let inner = trimmed.strip_prefix('[')?.strip_suffix(']')?;
    let (first, second) = inner.split_once("][")?;
    let (left, top) = first.split_once(',')?;
    let (right, bottom) = second.split_once(',')?;
    Some((
        left.trim().parse().ok()?,
        top.trim().parse().ok()?,
        right.trim().parse().ok()?,
        bottom.trim().parse().ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(resource_id: &str, text: &str, desc: &str) -> UiNode {
        UiNode {
            resource_id: resource_id.to_string(),
            text: text.to_string(),
            content_desc: desc.to_string(),
            ..UiNode::default()
        }
    }

    #[test]
    fn id_locator_accepts_prefixed_and_bare_forms() {
        let full = node("com.hexin.plat.android:id/close_button", "", "");
        assert!(Locator::Id("close_button".to_string()).matches(&full));
        assert!(
            Locator::Id("com.hexin.plat.android:id/close_button".to_string()).matches(&full)
        );
        assert!(!Locator::Id("open_button".to_string()).matches(&full));
    }

    #[test]
    fn text_locator_is_exact_not_substring() {
        let row = node("", " 1234****5678 ", "");
        assert!(Locator::Text("1234****5678".to_string()).matches(&row));
        assert!(!Locator::Text("1234".to_string()).matches(&row));
    }

    #[test]
    fn desc_locator_matches_trimmed() {
        let tab = node("", "", "交易");
        assert!(Locator::Desc("交易".to_string()).matches(&tab));
        assert!(!Locator::Desc("行情".to_string()).matches(&tab));
    }

    #[test]
    fn parses_bounds_and_center() {
        assert_eq!(parse_bounds("[0,0][100,200]"), Some((0, 0, 100, 200)));
        assert_eq!(parse_bounds("garbage"), None);

        let button = UiNode {
            bounds: Some((10, 20, 30, 60)),
            ..UiNode::default()
        };
        assert_eq!(button.center(), Some((20, 40)));
    }

    #[test]
    fn locator_round_trips_through_json() {
        let locator = Locator::Text("交易".to_string());
        let raw = serde_json::to_string(&locator).expect("serialize");
        assert_eq!(raw, "{\"by\":\"text\",\"value\":\"交易\"}");
        let parsed: Locator = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(parsed, locator);
    }
}
