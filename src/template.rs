//! Placeholder resolution for service configuration sources.
//!
//! Configuration text may reference `${name}` placeholders which are
//! substituted from a registry of named templates before the text is
//! handed to a work kind. A literal `$` is written as `$$`.

use std::collections::BTreeMap;
use std::path::Path;

use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(\$|\{([A-Za-z_][A-Za-z0-9_]*)\})").unwrap());

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Unresolved placeholders: {}", names.join(", "))]
    Unresolved { names: Vec<String> },
}

/// A named substitution value with a fallback for when the value is
/// not known at registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTemplate {
    pub name: String,
    pub value: String,
    pub default: String,
}

impl ConfigTemplate {
    pub fn new(name: impl Into<String>, value: impl Into<String>, default: impl Into<String>) -> Self {
        ConfigTemplate {
            name: name.into(),
            value: value.into(),
            default: default.into(),
        }
    }
}

/// Ordered collection of templates. Registering a name twice replaces
/// the earlier entry, so later sources win.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: Vec<ConfigTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        TemplateRegistry::default()
    }

    pub fn register(&mut self, template: ConfigTemplate) {
        if let Some(existing) = self.templates.iter_mut().find(|t| t.name == template.name) {
            debug!(name = %template.name, "replacing registered template");
            *existing = template;
        } else {
            self.templates.push(template);
        }
    }

    pub fn to_resolver(&self) -> TemplateResolver {
        let values = self
            .templates
            .iter()
            .map(|t| {
                let effective = if t.value.is_empty() { t.default.clone() } else { t.value.clone() };
                (t.name.clone(), effective)
            })
            .collect();

        TemplateResolver { values }
    }
}

/// Immutable name to value mapping used for the actual substitution.
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    values: BTreeMap<String, String>,
}

impl TemplateResolver {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Substitute every placeholder in `text`. Unknown names are
    /// collected and reported together rather than one at a time.
    pub fn resolve(&self, text: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(text.len());
        let mut missing = Vec::new();
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(text) {
            let whole = caps.get(0).unwrap();
            out.push_str(&text[last..whole.start()]);
            last = whole.end();

            match caps.get(2) {
                None => out.push('$'),
                Some(name) => match self.values.get(name.as_str()) {
                    Some(value) => out.push_str(value),
                    None => missing.push(name.as_str().to_string()),
                },
            }
        }
        out.push_str(&text[last..]);

        if missing.is_empty() {
            Ok(out)
        } else {
            let names = missing.into_iter().sorted().dedup().collect();
            Err(TemplateError::Unresolved { names })
        }
    }
}

/// Templates every service configuration may rely on, derived from the
/// task parameters and from this host. `localworkdir`, `hostname` and
/// `dataname` differ between hosts on purpose, so configurations that
/// must resolve identically on all ranks should avoid them.
pub fn standard_templates(workdir: &Path, modules: &[String]) -> Vec<ConfigTemplate> {
    let hostname = crate::node::hostname().unwrap_or_else(|_| String::from("localhost"));
    let dataname = crate::node::data_name().unwrap_or_else(|| hostname.clone());
    let localworkdir = workdir.join(&hostname);

    vec![
        ConfigTemplate::new("workdir", workdir.to_string_lossy(), ""),
        ConfigTemplate::new("localworkdir", localworkdir.to_string_lossy(), ""),
        ConfigTemplate::new("hostname", hostname, "localhost"),
        ConfigTemplate::new("dataname", dataname, "localhost"),
        ConfigTemplate::new("modules", modules.join(","), ""),
        ConfigTemplate::new("user", std::env::var("USER").unwrap_or_default(), "nobody"),
    ]
}
