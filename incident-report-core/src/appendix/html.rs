use super::AppendixSection;
use crate::config::PageSize;

/// Escape text for inclusion in HTML element content or attribute values
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Self-contained document for one section: inline styles, no scripts, and a
/// content policy that blocks every external fetch.
pub fn section_html(section: &AppendixSection, page_size: PageSize) -> String {
    let paragraphs: String = section
        .body
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>\n", escape_html(p)))
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta http-equiv="Content-Security-Policy" content="default-src 'none'; style-src 'unsafe-inline'">
<title>{title}</title>
<style>
@page {{ size: {size}; margin: 20mm; }}
html, body {{ margin: 0; padding: 0; }}
body {{ font-family: Helvetica, Arial, sans-serif; font-size: 10.5pt; line-height: 1.35; color: #111; }}
header {{ font-size: 8pt; color: #555; border-bottom: 1px solid #bbb; padding-bottom: 4pt; margin-bottom: 12pt; }}
h1 {{ font-size: 15pt; margin: 0 0 10pt 0; }}
p {{ margin: 0 0 8pt 0; white-space: pre-wrap; }}
</style>
</head>
<body>
<header>{header}</header>
<h1>{title}</h1>
{paragraphs}</body>
</html>
"#,
        title = escape_html(&section.title),
        header = escape_html(&section.header()),
        size = page_size.css_name(),
        paragraphs = paragraphs,
    )
}
