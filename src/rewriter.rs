//! HTML/CSS content rewriting
//!
//! Transforms upstream payloads so they keep working when served from the
//! proxy's origin:
//! - Absolutizes relative references from a fixed element/attribute table
//! - Rewrites `url(...)` values in inline styles and `<style>` blocks
//! - Inserts a `<base href>` so missed references still resolve client-side
//! - Injects the fixed script tag plus a navigation-interception script,
//!   marked so repeated rewriting never duplicates them
//!
//! HTML runs through lol_html in two passes: a probe pass that learns the
//! document structure (base present? already injected? body/head present?)
//! and a rewrite pass driven by those findings. Any parse or transform
//! failure degrades to passing the original body through unmodified.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::OnceLock;

use bytes::Bytes;
use lol_html::html_content::ContentType;
use lol_html::{element, text, HtmlRewriter, Settings};
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

/// Marker attribute on injected script tags; its presence makes re-injection
/// a no-op.
pub const INJECT_MARKER_ATTR: &str = "data-proxy-injected";

/// Marker attribute stamped on every form in a rewritten document
pub const FORM_MARKER_ATTR: &str = "data-proxy-form";

/// Fixed element/attribute pairs whose values are absolutized
const URL_ATTRIBUTES: &[(&str, &str)] = &[
    ("a", "href"),
    ("link", "href"),
    ("area", "href"),
    ("base", "href"),
    ("img", "src"),
    ("script", "src"),
    ("iframe", "src"),
    ("frame", "src"),
    ("embed", "src"),
    ("source", "src"),
    ("input", "src"),
    ("audio", "src"),
    ("video", "src"),
    ("track", "src"),
    ("form", "action"),
    ("object", "data"),
    ("video", "poster"),
];

/// Element/attribute pairs holding multi-valued srcset lists
const SRCSET_ATTRIBUTES: &[(&str, &str)] = &[("img", "srcset"), ("source", "srcset")];

/// Read-only context for all rewrite operations, derived once per request
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// Full URL of the document being rewritten; anchor for relative
    /// resolution (origin for absolute-path refs, directory for relative)
    pub target: Url,
    /// Externally visible proxy endpoint that navigation routes back through
    pub proxy_base: String,
    /// URL of the fixed injected script
    pub script_url: String,
}

impl RewriteContext {
    pub fn new(target: Url, proxy_base: impl Into<String>, script_url: impl Into<String>) -> Self {
        Self {
            target,
            proxy_base: proxy_base.into(),
            script_url: script_url.into(),
        }
    }

    /// Resolve a reference against the target document per RFC 3986.
    /// Returns `None` when the value should be left untouched: empty,
    /// fragment-only, data URIs, and anything already absolute.
    pub fn resolve(&self, reference: &str) -> Option<String> {
        let trimmed = reference.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        // Anything with a scheme (https:, data:, mailto:, javascript:)
        // parses as absolute and passes through unchanged.
        if Url::parse(trimmed).is_ok() {
            return None;
        }
        self.target.join(trimmed).ok().map(|url| url.into())
    }

    /// Rewrite an upstream `Location` value to route back through the proxy.
    /// Absolute locations become `<proxy_base>?url=<encoded>`; relative ones
    /// are returned unchanged for the client to resolve against the
    /// rewritten base.
    pub fn rewrite_location(&self, location: &str) -> String {
        if Url::parse(location).is_err() {
            return location.to_string();
        }
        match Url::parse_with_params(&self.proxy_base, &[("url", location)]) {
            Ok(url) => url.into(),
            Err(_) => location.to_string(),
        }
    }
}

/// Result of a rewrite attempt. `Passthrough` means the caller must send the
/// original body; a partially rewritten document is never observable.
#[derive(Debug)]
pub enum RewriteOutcome {
    Rewritten(Bytes),
    Passthrough,
}

/// Rewrite a payload according to its content type. Only HTML, XHTML, and
/// CSS are transformed; every other type is opaque passthrough.
pub fn rewrite(body: &Bytes, content_type: Option<&str>, ctx: &RewriteContext) -> RewriteOutcome {
    let Some(content_type) = content_type else {
        return RewriteOutcome::Passthrough;
    };
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match media_type.as_str() {
        "text/html" | "application/xhtml+xml" => match rewrite_html(body, ctx) {
            Ok(rewritten) => RewriteOutcome::Rewritten(Bytes::from(rewritten)),
            Err(e) => {
                warn!("HTML rewrite failed for {}: {}, passing through", ctx.target, e);
                RewriteOutcome::Passthrough
            }
        },
        "text/css" => match std::str::from_utf8(body) {
            Ok(css) => RewriteOutcome::Rewritten(Bytes::from(rewrite_css_text(css, ctx))),
            Err(_) => {
                warn!("CSS body for {} is not UTF-8, passing through", ctx.target);
                RewriteOutcome::Passthrough
            }
        },
        _ => RewriteOutcome::Passthrough,
    }
}

/// Structure learned from the probe pass
#[derive(Debug, Default, Clone, Copy)]
struct DocumentProbe {
    has_head: bool,
    has_body: bool,
    has_html: bool,
    has_base: bool,
    already_injected: bool,
}

/// First pass: discover document structure without producing output
fn probe_document(body: &[u8]) -> Result<DocumentProbe, lol_html::errors::RewritingError> {
    let has_head = Cell::new(false);
    let has_body = Cell::new(false);
    let has_html = Cell::new(false);
    let has_base = Cell::new(false);
    let already_injected = Cell::new(false);

    let marker_selector = format!("script[{}]", INJECT_MARKER_ATTR);
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("head", |_| {
                    has_head.set(true);
                    Ok(())
                }),
                element!("body", |_| {
                    has_body.set(true);
                    Ok(())
                }),
                element!("html", |_| {
                    has_html.set(true);
                    Ok(())
                }),
                element!("base", |_| {
                    has_base.set(true);
                    Ok(())
                }),
                element!(marker_selector, |_| {
                    already_injected.set(true);
                    Ok(())
                }),
            ],
            ..Settings::new()
        },
        |_: &[u8]| {},
    );
    rewriter.write(body)?;
    rewriter.end()?;

    Ok(DocumentProbe {
        has_head: has_head.get(),
        has_body: has_body.get(),
        has_html: has_html.get(),
        has_base: has_base.get(),
        already_injected: already_injected.get(),
    })
}

/// Second pass: rewrite references, insert base, inject scripts
fn rewrite_html(
    body: &[u8],
    ctx: &RewriteContext,
) -> Result<Vec<u8>, lol_html::errors::RewritingError> {
    let probe = probe_document(body)?;
    debug!("Document probe for {}: {:?}", ctx.target, probe);

    let mut handlers = Vec::new();

    for (tag, attr) in URL_ATTRIBUTES {
        let attr = attr.to_string();
        handlers.push(element!(format!("{}[{}]", tag, attr), move |el| {
            if let Some(value) = el.get_attribute(&attr) {
                if let Some(resolved) = ctx.resolve(&value) {
                    el.set_attribute(&attr, &resolved)?;
                }
            }
            Ok(())
        }));
    }

    for (tag, attr) in SRCSET_ATTRIBUTES {
        let attr = attr.to_string();
        handlers.push(element!(format!("{}[{}]", tag, attr), move |el| {
            if let Some(value) = el.get_attribute(&attr) {
                el.set_attribute(&attr, &rewrite_srcset(&value, ctx))?;
            }
            Ok(())
        }));
    }

    // url(...) inside inline style attributes
    handlers.push(element!("[style]", move |el| {
        if let Some(value) = el.get_attribute("style") {
            el.set_attribute("style", &rewrite_css_text(&value, ctx))?;
        }
        Ok(())
    }));

    // url(...) inside <style> blocks; text arrives chunked, so buffer until
    // the last chunk of the text node before rewriting.
    let style_buffer: Rc<RefCell<String>> = Rc::new(RefCell::new(String::new()));
    {
        let style_buffer = Rc::clone(&style_buffer);
        handlers.push(text!("style", move |chunk| {
            style_buffer.borrow_mut().push_str(chunk.as_str());
            if chunk.last_in_text_node() {
                let rewritten = rewrite_css_text(&style_buffer.borrow(), ctx);
                chunk.replace(&rewritten, ContentType::Html);
                style_buffer.borrow_mut().clear();
            } else {
                chunk.remove();
            }
            Ok(())
        }));
    }

    // Mark every form as proxied (action rewriting is covered by the table)
    handlers.push(element!("form", move |el| {
        el.set_attribute(FORM_MARKER_ATTR, "1")?;
        Ok(())
    }));

    if !probe.has_base && probe.has_head {
        let base_tag = format!("<base href=\"{}\">", attr_escape(ctx.target.as_str()));
        handlers.push(element!("head", move |el| {
            el.prepend(&base_tag, ContentType::Html);
            Ok(())
        }));
    }

    let injection = if probe.already_injected {
        None
    } else {
        Some(injection_markup(ctx))
    };

    if let Some(markup) = injection.clone() {
        if probe.has_body {
            handlers.push(element!("body", move |el| {
                el.append(&markup, ContentType::Html);
                Ok(())
            }));
        } else if probe.has_html {
            handlers.push(element!("html", move |el| {
                el.append(&markup, ContentType::Html);
                Ok(())
            }));
        }
    }

    let mut output = Vec::with_capacity(body.len() + 1024);
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::new()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );
    rewriter.write(body)?;
    rewriter.end()?;

    // Fragment without body or html: append at document end
    if let Some(markup) = injection {
        if !probe.has_body && !probe.has_html {
            output.extend_from_slice(markup.as_bytes());
        }
    }

    Ok(output)
}

/// Rewrite each candidate URL of a srcset value independently.
///
/// Candidates cannot be split naively on commas: data URIs contain commas.
/// Each URL runs to the next whitespace; a trailing comma on the URL is the
/// separator for a descriptor-less candidate, otherwise the descriptor runs
/// to the next comma.
fn rewrite_srcset(value: &str, ctx: &RewriteContext) -> String {
    let mut candidates: Vec<String> = Vec::new();
    let mut rest = value.trim_start_matches(|c: char| c.is_whitespace() || c == ',');

    while !rest.is_empty() {
        let url_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (mut url_part, mut tail) = rest.split_at(url_end);
        let mut descriptor = None;

        if url_part.ends_with(',') {
            url_part = url_part.trim_end_matches(',');
        } else {
            tail = tail.trim_start();
            match tail.find(',') {
                Some(comma) => {
                    let d = tail[..comma].trim();
                    if !d.is_empty() {
                        descriptor = Some(d.to_string());
                    }
                    tail = &tail[comma + 1..];
                }
                None => {
                    let d = tail.trim();
                    if !d.is_empty() {
                        descriptor = Some(d.to_string());
                    }
                    tail = "";
                }
            }
        }

        let resolved = ctx
            .resolve(url_part)
            .unwrap_or_else(|| url_part.to_string());
        candidates.push(match descriptor {
            Some(descriptor) => format!("{} {}", resolved, descriptor),
            None => resolved,
        });

        rest = tail.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
    }

    candidates.join(", ")
}

fn css_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"url\(\s*(['"]?)([^'")]+)['"]?\s*\)"#).expect("css url pattern compiles")
    })
}

/// Rewrite `url(...)` references in CSS text. Data URIs and absolute URLs
/// are left untouched.
pub fn rewrite_css_text(css: &str, ctx: &RewriteContext) -> String {
    css_url_regex()
        .replace_all(css, |caps: &regex::Captures<'_>| {
            let quote = &caps[1];
            let reference = caps[2].trim();
            match ctx.resolve(reference) {
                Some(resolved) => format!("url({}{}{})", quote, resolved, quote),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Markup appended to the document: the fixed script tag plus the
/// navigation-interception script, both carrying the idempotence marker.
fn injection_markup(ctx: &RewriteContext) -> String {
    // serde_json produces a quoted, escaped JS string literal
    let proxy_literal =
        serde_json::to_string(&ctx.proxy_base).unwrap_or_else(|_| "\"\"".to_string());
    let nav_script = format!(
        "(function(){{\
var PROXY={proxy};\
function abs(u){{try{{return new URL(u,document.baseURI).href;}}catch(e){{return u;}}}}\
document.addEventListener('click',function(ev){{\
var t=ev.target;\
while(t&&!(t.tagName==='A'&&t.getAttribute('href')))t=t.parentElement;\
if(!t)return;\
var href=t.getAttribute('href');\
if(!href||href.charAt(0)==='#')return;\
ev.preventDefault();\
window.location.href=PROXY+'?url='+encodeURIComponent(abs(href));\
}},true);\
document.addEventListener('submit',function(ev){{\
var f=ev.target;\
if(!f||f.tagName!=='FORM')return;\
ev.preventDefault();\
var action=f.getAttribute('action')||window.location.href;\
window.location.href=PROXY+'?url='+encodeURIComponent(abs(action));\
}},true);\
}})();",
        proxy = proxy_literal
    );

    format!(
        "<script src=\"{src}\" {marker}=\"true\"></script>\
<script {marker}=\"true\">{nav}</script>",
        src = attr_escape(&ctx.script_url),
        marker = INJECT_MARKER_ATTR,
        nav = nav_script
    )
}

/// Minimal escaping for values placed in double-quoted HTML attributes
fn attr_escape(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}
