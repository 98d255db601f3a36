use handlebars::Handlebars;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Matches either an already-doubled `{{token}}` (kept as-is) or a
/// single-brace `{token}` placeholder as admins write them in the console.
static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{[^{}]*\}\}|\{([A-Za-z_][A-Za-z0-9_.]*)\}").expect("hardcoded pattern")
});

/// Rewrites `{token}` placeholders into `{{token}}` so persisted prompt
/// bodies can go straight through the template engine. Text that is not a
/// placeholder (stray braces, `{2}` and friends) is left alone.
pub fn convert_placeholders(template: &str) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| match caps.get(1) {
            Some(name) => format!("{{{{{}}}}}", name.as_str()),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Renders a Handlebars template against `data`. Output is chat text, not
/// HTML, so no escaping is applied. Missing fields render as empty strings.
pub fn render_template(template: &str, data: &impl Serialize) -> Result<String, handlebars::RenderError> {
    let mut hbs = Handlebars::new();
    hbs.register_escape_fn(handlebars::no_escape);
    hbs.render_template(template, data)
}

/// Renders like [`render_template`], but a malformed template falls back to
/// its raw text instead of failing the turn.
pub fn render_lenient(template: &str, data: &impl Serialize) -> String {
    match render_template(template, data) {
        Ok(rendered) => rendered,
        Err(e) => {
            tracing::warn!("template failed to render, using raw text: {e}");
            template.to_string()
        }
    }
}

/// Cuts `s` down to at most `max` characters, never splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
