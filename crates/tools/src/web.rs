//! Web fetch tool.
//!
//! Retrieves a URL, strips HTML tags for readability, and caps the
//! content at 50 KB. Some sites block automated requests; those failures
//! come back as error strings for the tool_result payload.

use serde_json::Value;

/// Content cap applied after tag stripping.
const MAX_CONTENT_BYTES: usize = 50 * 1024;

/// Fetch a URL and return readable text content.
pub async fn web_fetch(url: &str) -> Result<Value, String> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(format!("invalid URL '{url}': only http(s) is supported"));
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .user_agent("skillrunner/0.1")
        .build()
        .map_err(|e| format!("http client error: {e}"))?;

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("fetch failed: {e}"))?;

    let status = resp.status();
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = resp.text().await.map_err(|e| format!("read failed: {e}"))?;

    if !status.is_success() {
        return Err(format!("HTTP {} fetching '{url}'", status.as_u16()));
    }

    let text = if content_type.contains("text/html") {
        strip_html(&body)
    } else {
        body
    };

    let mut truncated = false;
    let mut content = text;
    if content.len() > MAX_CONTENT_BYTES {
        let mut end = MAX_CONTENT_BYTES;
        while end > 0 && !content.is_char_boundary(end) {
            end -= 1;
        }
        content.truncate(end);
        truncated = true;
    }

    Ok(serde_json::json!({
        "url": url,
        "content_type": content_type,
        "content": content,
        "truncated": truncated,
    }))
}

/// ASCII-case-insensitive prefix check at a byte offset.
fn starts_with_ci(html: &str, at: usize, tag: &str) -> bool {
    let bytes = html.as_bytes();
    at + tag.len() <= bytes.len() && bytes[at..at + tag.len()].eq_ignore_ascii_case(tag.as_bytes())
}

/// Strip tags, scripts, and styles from HTML; collapse whitespace runs.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut chars = html.char_indices();
    let mut skip_until: Option<&str> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(end_tag) = skip_until {
            if starts_with_ci(html, i, end_tag) {
                for _ in 0..end_tag.len() - 1 {
                    chars.next();
                }
                skip_until = None;
            }
            continue;
        }
        if c == '<' {
            if starts_with_ci(html, i, "<script") {
                skip_until = Some("</script>");
                continue;
            }
            if starts_with_ci(html, i, "<style") {
                skip_until = Some("</style>");
                continue;
            }
            // Skip to the closing '>'.
            for (_, tc) in chars.by_ref() {
                if tc == '>' {
                    break;
                }
            }
            out.push(' ');
            continue;
        }
        out.push(c);
    }

    // Collapse whitespace runs; keep paragraph breaks.
    let mut collapsed = String::with_capacity(out.len());
    let mut last_was_space = false;
    let mut newlines = 0;
    for c in out.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines <= 2 {
                collapsed.push('\n');
            }
            last_was_space = true;
        } else if c.is_whitespace() {
            if !last_was_space {
                collapsed.push(' ');
            }
            last_was_space = true;
        } else {
            collapsed.push(c);
            last_was_space = false;
            newlines = 0;
        }
    }
    collapsed.trim().to_string()
}
