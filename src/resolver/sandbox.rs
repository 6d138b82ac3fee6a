//! Isolated QuickJS evaluation of untrusted page scripts.
//!
//! Each evaluation gets a fresh runtime with a memory cap and a wall-clock
//! interrupt. The global object only holds the shims below: a console that
//! records into an array, `atob`/`btoa`, a navigator and inert
//! document/window stand-ins. No module loader, timers, network or
//! filesystem bindings are installed.

use rquickjs::{CatchResultExt, CaughtError, Context, Runtime};
use std::time::{Duration, Instant};

use super::extract::{DOCUMENT_STAND_IN, WINDOW_STAND_IN};
use crate::error::{Result, StreamError};

const MEMORY_LIMIT: usize = 32 * 1024 * 1024;
const CAPTURE_GLOBAL: &str = "__captured";

fn shim_source(user_agent: &str) -> String {
    let ua = serde_json::to_string(user_agent).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"
var {CAPTURE_GLOBAL} = [];
var console = {{
    log: function () {{
        var parts = [];
        for (var i = 0; i < arguments.length; i++) parts.push(String(arguments[i]));
        {CAPTURE_GLOBAL}.push(parts.join(' '));
    }}
}};
console.info = console.log; console.warn = console.log; console.error = console.log; console.debug = console.log;
var __b64 = 'ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/=';
function atob(input) {{
    var str = String(input).replace(/[^A-Za-z0-9+/=]/g, '');
    var out = '';
    for (var i = 0; i < str.length;) {{
        var e1 = __b64.indexOf(str.charAt(i++)), e2 = __b64.indexOf(str.charAt(i++));
        var e3 = __b64.indexOf(str.charAt(i++)), e4 = __b64.indexOf(str.charAt(i++));
        if (e3 < 0) e3 = 64;
        if (e4 < 0) e4 = 64;
        out += String.fromCharCode((e1 << 2) | (e2 >> 4));
        if (e3 !== 64) out += String.fromCharCode(((e2 & 15) << 4) | (e3 >> 2));
        if (e4 !== 64) out += String.fromCharCode(((e3 & 3) << 6) | e4);
    }}
    return out;
}}
function btoa(input) {{
    var str = String(input), out = '';
    for (var i = 0; i < str.length; i += 3) {{
        var c1 = str.charCodeAt(i) & 255;
        var c2 = i + 1 < str.length ? str.charCodeAt(i + 1) & 255 : NaN;
        var c3 = i + 2 < str.length ? str.charCodeAt(i + 2) & 255 : NaN;
        out += __b64.charAt(c1 >> 2);
        out += __b64.charAt(((c1 & 3) << 4) | (isNaN(c2) ? 0 : c2 >> 4));
        out += isNaN(c2) ? '=' : __b64.charAt(((c2 & 15) << 2) | (isNaN(c3) ? 0 : c3 >> 6));
        out += isNaN(c3) ? '=' : __b64.charAt(c3 & 63);
    }}
    return out;
}}
var navigator = {{ userAgent: {ua}, platform: 'Win32', language: 'en-US' }};
var __inertElement = {{ style: {{}}, setAttribute: function () {{}}, appendChild: function () {{}}, addEventListener: function () {{}} }};
var {DOCUMENT_STAND_IN} = {{
    cookie: '', title: '', referrer: '',
    querySelector: function () {{ return __inertElement; }},
    querySelectorAll: function () {{ return []; }},
    getElementById: function () {{ return __inertElement; }},
    createElement: function () {{ return __inertElement; }},
    addEventListener: function () {{}}
}};
var {WINDOW_STAND_IN} = {{ navigator: navigator, location: {{ href: '' }}, addEventListener: function () {{}}, atob: atob, btoa: btoa }};
"#
    )
}

/// Script evaluator with a per-run timeout.
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    timeout: Duration,
    user_agent: String,
}

impl ScriptSandbox {
    pub fn new(timeout: Duration, user_agent: impl Into<String>) -> Self {
        Self {
            timeout,
            user_agent: user_agent.into(),
        }
    }

    /// Run `script` on a blocking thread and return its console output.
    ///
    /// Exceptions and timeouts are not errors: whatever was logged before
    /// the failure is returned. `Err` only when the engine itself could not
    /// be set up.
    pub async fn evaluate(&self, script: String) -> Result<String> {
        let sandbox = self.clone();
        tokio::task::spawn_blocking(move || sandbox.evaluate_blocking(&script))
            .await
            .map_err(|e| StreamError::Sandbox(format!("evaluation task failed: {e}")))?
    }

    pub fn evaluate_blocking(&self, script: &str) -> Result<String> {
        let runtime = Runtime::new().map_err(|e| StreamError::Sandbox(e.to_string()))?;
        runtime.set_memory_limit(MEMORY_LIMIT);
        let deadline = Instant::now() + self.timeout;
        runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

        let context = Context::full(&runtime).map_err(|e| StreamError::Sandbox(e.to_string()))?;
        let shim = shim_source(&self.user_agent);

        Ok(context.with(|ctx| {
            if let Err(e) = ctx.eval::<(), _>(shim).catch(&ctx) {
                tracing::warn!("sandbox shim failed: {}", describe(e));
                return String::new();
            }
            if let Err(e) = ctx.eval::<(), _>(script).catch(&ctx) {
                tracing::debug!("sandboxed script stopped: {}", describe(e));
            }
            // Read back without running JS, the interrupt may already be armed.
            ctx.globals()
                .get::<_, Vec<String>>(CAPTURE_GLOBAL)
                .map(|lines| lines.join("\n"))
                .unwrap_or_default()
        }))
    }
}

fn describe(caught: CaughtError<'_>) -> String {
    match caught {
        CaughtError::Exception(exc) => exc.message().unwrap_or_else(|| "exception".to_string()),
        CaughtError::Value(_) => "non-error value thrown".to_string(),
        CaughtError::Error(err) => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::extract::{neutralize_script, parse_source};

    fn sandbox() -> ScriptSandbox {
        ScriptSandbox::new(Duration::from_millis(500), "test-agent")
    }

    #[test]
    fn test_captures_console_output() {
        let out = sandbox()
            .evaluate_blocking("console.log('a', 1); console.log('b');")
            .unwrap();
        assert_eq!(out, "a 1\nb");
    }

    #[test]
    fn test_eval_payload_is_logged_not_run() {
        let script = neutralize_script(
            r#"eval("var source='https://cdn.example/v/uwu.m3u8';document.querySelector('video').src=source")"#,
        );
        let out = sandbox().evaluate_blocking(&script).unwrap();
        assert_eq!(
            parse_source(&out).as_deref(),
            Some("https://cdn.example/v/uwu.m3u8")
        );
    }

    #[test]
    fn test_packed_function_output() {
        let script = neutralize_script(
            r#"eval(function(p,a,c,k,e,d){return p.replace('X', k[0])}("const source='https://cdn.example/X/uwu.m3u8'",1,1,'hls'.split('|'),0,{}))"#,
        );
        let out = sandbox().evaluate_blocking(&script).unwrap();
        assert_eq!(
            parse_source(&out).as_deref(),
            Some("https://cdn.example/hls/uwu.m3u8")
        );
    }

    #[test]
    fn test_throw_keeps_earlier_output() {
        let out = sandbox()
            .evaluate_blocking("console.log('before'); undefinedFunction(); console.log('after');")
            .unwrap();
        assert_eq!(out, "before");
    }

    #[test]
    fn test_infinite_loop_is_interrupted() {
        let started = Instant::now();
        let out = sandbox()
            .evaluate_blocking("console.log('spin'); while (true) {}")
            .unwrap();
        assert_eq!(out, "spin");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_base64_shims() {
        let out = sandbox()
            .evaluate_blocking("console.log(btoa('hello')); console.log(atob('aGVsbG8='));")
            .unwrap();
        assert_eq!(out, "aGVsbG8=\nhello");
    }

    #[test]
    fn test_no_host_capabilities() {
        let out = sandbox()
            .evaluate_blocking(
                "console.log(typeof require, typeof fetch, typeof XMLHttpRequest, typeof setTimeout);",
            )
            .unwrap();
        assert_eq!(out, "undefined undefined undefined undefined");
    }

    #[tokio::test]
    async fn test_async_evaluate() {
        let out = sandbox()
            .evaluate("console.log(navigator.userAgent)".to_string())
            .await
            .unwrap();
        assert_eq!(out, "test-agent");
    }
}
