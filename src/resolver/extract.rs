//! Locating and reading the obfuscated player script of an embed page.

/// Name the page's `document` references are redirected to.
pub const DOCUMENT_STAND_IN: &str = "__sandboxDocument";

/// Name the page's `window` references are redirected to.
pub const WINDOW_STAND_IN: &str = "__sandboxWindow";

/// First inline script that either calls `eval(` or assigns an `.m3u8`
/// source directly.
pub fn find_player_script(html: &str) -> Option<&str> {
    let script_re = regex!(r"(?is)<script\b[^>]*>(.*?)</script>");
    script_re
        .captures_iter(html)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|body| !body.trim().is_empty())
        .find(|body| {
            body.contains("eval(")
                || (regex!(r"source\s*=").is_match(body) && body.contains(".m3u8"))
        })
}

/// Redirect browser globals to inert stand-ins and turn `eval(` into a
/// console write, so running the script prints the code it would execute.
pub fn neutralize_script(script: &str) -> String {
    script
        .replace("document", DOCUMENT_STAND_IN)
        .replace("window", WINDOW_STAND_IN)
        .replace("eval(", "console.log(")
}

/// First `.m3u8` URL found in captured console output.
///
/// Per line, an explicit `source = '…m3u8'` assignment wins over a bare URL.
pub fn parse_source(output: &str) -> Option<String> {
    let assign_re =
        regex!(r#"(?:(?:var|let|const)\s+)?\bsource\s*=\s*['"]([^'"]+\.m3u8[^'"]*)['"]"#);
    let url_re = regex!(r#"https?://[^\s'"\\]+\.m3u8(?:\?[^\s'"\\]*)?"#);

    output.lines().find_map(|line| {
        if let Some(caps) = assign_re.captures(line) {
            return Some(caps[1].to_string());
        }
        url_re.find(line).map(|m| m.as_str().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_eval_script() {
        let html = r#"
            <html><head>
            <script src="/player.js"></script>
            <script>var analytics = 1;</script>
            <script type="text/javascript">eval(function(p,a,c,k,e,d){return p}('x',1,1,'x'.split('|'),0,{}))</script>
            </head></html>"#;
        let script = find_player_script(html).unwrap();
        assert!(script.starts_with("eval(function"));
    }

    #[test]
    fn test_find_direct_source_script() {
        let html = r#"<script>const source='https://cdn.example/a/uwu.m3u8';</script>"#;
        assert_eq!(
            find_player_script(html),
            Some("const source='https://cdn.example/a/uwu.m3u8';")
        );
    }

    #[test]
    fn test_no_player_script() {
        let html = r#"<script>console.log("hello")</script><p>eval( in text</p>"#;
        assert!(find_player_script(html).is_none());
    }

    #[test]
    fn test_neutralize_script() {
        let out = neutralize_script("eval(window.atob(document.title))");
        assert_eq!(
            out,
            "console.log(__sandboxWindow.atob(__sandboxDocument.title))"
        );
    }

    #[test]
    fn test_parse_source_assignment() {
        let output = "var player=1;\nconst source='https://na-02.owocdn.top/stream/01/06/abc/uwu.m3u8';const x=2\n";
        assert_eq!(
            parse_source(output).as_deref(),
            Some("https://na-02.owocdn.top/stream/01/06/abc/uwu.m3u8")
        );
    }

    #[test]
    fn test_parse_source_bare_url() {
        let output = "setup({file:\"https://cdn.example/hls/master.m3u8?token=abc\"})";
        assert_eq!(
            parse_source(output).as_deref(),
            Some("https://cdn.example/hls/master.m3u8?token=abc")
        );
    }

    #[test]
    fn test_parse_source_first_line_wins() {
        let output = "a https://one.example/x.m3u8\nsource='https://two.example/y.m3u8'";
        assert_eq!(
            parse_source(output).as_deref(),
            Some("https://one.example/x.m3u8")
        );
        assert!(parse_source("nothing here\n").is_none());
    }
}
