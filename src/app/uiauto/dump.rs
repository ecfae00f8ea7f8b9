use super::locator::{parse_bounds, UiNode};

/// Extracts every `<node>` element from a `uiautomator dump` hierarchy.
///
/// The dump arrives over `adb exec-out` as a single XML document,
/// sometimes followed by a `UI hierchary dumped to: ...` trailer line;
/// anything outside `<... >` tags is ignored. Attribute values are
/// entity-escaped by uiautomator, so they are unescaped here.
pub fn parse_ui_dump(xml: &str) -> Vec<UiNode> {
    let mut nodes = Vec::new();
    let bytes = xml.as_bytes();
    let mut cursor = 0usize;

    while let Some(open) = find_from(bytes, cursor, b'<') {
        let Some(close) = find_from(bytes, open + 1, b'>') else {
            break;
        };
        let tag = &xml[open + 1..close];
        cursor = close + 1;

        let body = tag.trim_start();
        let Some(rest) = body.strip_prefix("node") else {
            continue;
        };
        if !rest.starts_with(char::is_whitespace) && !rest.is_empty() && rest != "/" {
            continue;
        }

        let mut node = UiNode::default();
        for (name, value) in parse_attributes(rest) {
            match name {
                "resource-id" => node.resource_id = unescape(value),
                "text" => node.text = unescape(value),
                "content-desc" => node.content_desc = unescape(value),
                "class" => node.class = unescape(value),
                "bounds" => node.bounds = parse_bounds(&unescape(value)),
                _ => {}
            }
        }
        nodes.push(node);
    }

    nodes
}

fn find_from(bytes: &[u8], start: usize, needle: u8) -> Option<usize> {
    bytes[start.min(bytes.len())..]
        .iter()
        .position(|byte| *byte == needle)
        .map(|offset| start + offset)
}

/// Walks `name="value"` pairs inside a tag body. uiautomator always
/// double-quotes attribute values.
fn parse_attributes(body: &str) -> Vec<(&str, &str)> {
    let mut attrs = Vec::new();
    let mut rest = body;
    loop {
        let Some(eq) = rest.find("=\"") else {
            break;
        };
        let name = rest[..eq].trim().trim_end_matches('/');
        let after = &rest[eq + 2..];
        let Some(end) = after.find('"') else {
            break;
        };
        if !name.is_empty() {
            attrs.push((name, &after[..end]));
        }
        rest = &after[end + 1..];
    }
    attrs
}

fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
