//! Static template catalog and the rendering pipeline turning structured
//! message bodies into user-facing text.
//!
//! Substitution is literal single-pass text replacement, not a template
//! engine: `{{name}}` placeholders are filled from the params mapping and the
//! substituted values are never rescanned, so a parameter containing
//! `{{...}}` syntax cannot trigger another round of substitution.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").expect("placeholder regex"));

static BUILTIN: Lazy<TemplateCatalog> = Lazy::new(|| {
    TemplateCatalog::from_yaml(include_str!("../templates/messages.yaml"))
        .expect("embedded template catalog is well-formed")
});

/// Mapping from template key to placeholder text, immutable after load.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: HashMap<String, String>,
}

impl TemplateCatalog {
    /// Catalog embedded at build time, parsed once per process.
    pub fn builtin() -> &'static TemplateCatalog {
        &BUILTIN
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        let templates: HashMap<String, String> = serde_yaml::from_str(raw)?;
        Ok(Self { templates })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.templates.get(key).map(String::as_str)
    }
}

/// Renders a structured body.
///
/// `body.template` naming a catalog entry selects placeholder substitution
/// driven by `body.params`; anything else falls back to the compact JSON form
/// of the whole body (lookup miss is not an error). An empty body renders to
/// an empty string.
pub fn render_from_body(catalog: &TemplateCatalog, body: &Map<String, Value>) -> String {
    let template = body
        .get("template")
        .and_then(Value::as_str)
        .and_then(|key| catalog.get(key));
    if let Some(template) = template {
        let empty = Map::new();
        let params = body.get("params").and_then(Value::as_object).unwrap_or(&empty);
        return render_template(template, params);
    }
    if body.is_empty() {
        String::new()
    } else {
        Value::Object(body.clone()).to_string()
    }
}

/// Replaces every `{{name}}` occurrence with the textual form of the
/// matching param entry. Absent or null params become empty strings; strings
/// are inserted without quotes, other scalars via their JSON form. Malformed
/// or overlapping placeholders are left unresolved.
pub fn render_template(template: &str, params: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match params.get(&caps[1]) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        })
        .into_owned()
}
