//! GraphQL query templates.
//!
//! The queries sent to GitHub are `.graphql` files with two kinds of tags:
//! `{{name}}` is replaced by the variable `name`, and
//! `{{#name}}...{{/name}}` is kept only when `name` is set. New filters are
//! added to the templates, the fetch logic does not change.

use std::collections::{BTreeMap, HashMap};

use log::trace;
use regex::{Captures, Regex};

/// The templates known to the advisory source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TemplateName {
    /// A page of advisories.
    Advisories,
    /// A page of the CWEs of one advisory.
    AdvisoryCwes,
    /// A page of the vulnerable packages of one advisory.
    AdvisoryVulnerabilities,
}

/// The variables substituted in a template.
pub type Variables = BTreeMap<&'static str, String>;

/// Renders the GraphQL templates.
pub struct QueryTemplates {
    sources: HashMap<TemplateName, &'static str>,
    section_regex: Regex,
    variable_regex: Regex,
}

impl QueryTemplates {
    /// Loads the bundled templates.
    pub fn new() -> Self {
        let mut sources = HashMap::new();
        sources.insert(
            TemplateName::Advisories,
            include_str!("templates/security_advisories.graphql"),
        );
        sources.insert(
            TemplateName::AdvisoryCwes,
            include_str!("templates/security_advisory_cwes.graphql"),
        );
        sources.insert(
            TemplateName::AdvisoryVulnerabilities,
            include_str!("templates/security_advisory_vulnerabilities.graphql"),
        );

        // Sections cannot nest; the closing name is checked when rendering.
        let section_regex = Regex::new(r"(?s)\{\{#(?P<open>\w+)\}\}(?P<body>.*?)\{\{/(?P<close>\w+)\}\}")
            .expect("Regex template/section is invalid");
        let variable_regex =
            Regex::new(r"\{\{(?P<name>\w+)\}\}").expect("Regex template/variable is invalid");

        QueryTemplates {
            sources,
            section_regex,
            variable_regex,
        }
    }

    /// Renders a bundled template.
    pub fn render(&self, name: TemplateName, variables: &Variables) -> String {
        trace!("Rendering template {:?}", name);
        let source = self.sources.get(&name).copied().unwrap_or_default();
        self.render_source(source, variables)
    }

    /// Renders any template text.
    pub fn render_source(&self, source: &str, variables: &Variables) -> String {
        let with_sections = self.section_regex.replace_all(source, |caps: &Captures| {
            let open = &caps["open"];
            if open != &caps["close"] {
                return caps[0].to_string();
            }
            match variables.get(open) {
                Some(value) if !value.is_empty() => caps["body"].to_string(),
                _ => String::new(),
            }
        });
        self.variable_regex
            .replace_all(&with_sections, |caps: &Captures| {
                variables
                    .get(&caps["name"])
                    .map(|value| escape(value))
                    .unwrap_or_default()
            })
            .into_owned()
    }
}

impl Default for QueryTemplates {
    fn default() -> Self {
        Self::new()
    }
}

/// Escapes a value placed inside a GraphQL string literal.
fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
