//! Template Renderer - render marketplace layouts with Handlebars

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::{Result, WaveError};

/// Renders layout templates. Output is not HTML-escaped: layouts carry their
/// markup inside CDATA sections, and callers escape plain-XML fields
/// themselves with [`xml_escape`].
pub struct TemplateRenderer {
    handlebars: Handlebars<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars.register_escape_fn(handlebars::no_escape);
        Self { handlebars }
    }

    /// Register a named template; syntax errors surface here, before any
    /// task is published.
    pub fn register(&mut self, name: &str, template: &str) -> Result<()> {
        self.handlebars
            .register_template_string(name, template)
            .map_err(|e| WaveError::Template(format!("Failed to register template '{}': {}", name, e)))
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.handlebars.get_template(name).is_some()
    }

    /// Render a registered template
    pub fn render<T: Serialize>(&self, name: &str, context: &T) -> Result<String> {
        self.handlebars
            .render(name, context)
            .map_err(|e| WaveError::Template(format!("Failed to render template '{}': {}", name, e)))
    }

    /// Render an unregistered template string
    pub fn render_str<T: Serialize>(&self, template: &str, context: &T) -> Result<String> {
        self.handlebars
            .render_template(template, context)
            .map_err(|e| WaveError::Template(format!("Failed to render template: {}", e)))
    }
}

/// Escape text for use as XML character data or an attribute value
pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_registered() {
        let mut renderer = TemplateRenderer::new();
        renderer.register("greet", "Hello {{name}}!").unwrap();
        assert!(renderer.has_template("greet"));
        let out = renderer.render("greet", &json!({"name": "<b>World</b>"})).unwrap();
        assert_eq!(out, "Hello <b>World</b>!");
    }

    #[test]
    fn test_strict_mode_rejects_missing_variable() {
        let renderer = TemplateRenderer::new();
        let err = renderer.render_str("{{missing}}", &json!({})).unwrap_err();
        assert!(matches!(err, WaveError::Template(_)));
    }

    #[test]
    fn test_register_invalid_template() {
        let mut renderer = TemplateRenderer::new();
        assert!(renderer.register("bad", "{{#if}}unclosed").is_err());
    }

    #[test]
    fn test_render_unknown_template() {
        let renderer = TemplateRenderer::new();
        assert!(renderer.render("nope", &json!({})).is_err());
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape(r#"a < b & "c" > 'd'"#), "a &lt; b &amp; &quot;c&quot; &gt; &apos;d&apos;");
        assert_eq!(xml_escape("plain"), "plain");
    }
}
