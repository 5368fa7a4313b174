//! Renders configuration templates with named placeholders.
//!
//! Placeholders look like `{{ .Name }}` (the leading dot and the inner
//! whitespace are optional). Rendering fails if any placeholder has no value;
//! anything else in the template is copied through untouched.

use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Values substituted into a template, keyed by placeholder name.
pub type TemplateValues = BTreeMap<String, String>;

/// Errors from rendering a template.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The template file could not be read.
    #[error("failed to read template {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The rendered file could not be written.
    #[error("failed to write rendered config: {0}")]
    Write(#[source] io::Error),

    /// The placeholder pattern failed to compile.
    #[error("invalid placeholder pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Some placeholders had no value.
    #[error("no value for template placeholder(s): {}", .names.join(", "))]
    MissingValues { names: Vec<String> },
}

/// A rendered configuration file; the file is deleted when this is dropped.
#[derive(Debug)]
pub struct RenderedConfig {
    file: NamedTempFile,
}

impl RenderedConfig {
    /// Path of the rendered file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

const PLACEHOLDER: &str = r"\{\{\s*\.?([A-Za-z_][A-Za-z0-9_]*)\s*\}\}";

/// Renders templates from strings or files.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigTemplater;

impl ConfigTemplater {
    /// Creates a templater.
    pub fn new() -> Self {
        Self
    }

    /// Substitutes every placeholder in `template`.
    pub fn render_str(
        &self,
        template: &str,
        values: &TemplateValues,
    ) -> Result<String, TemplateError> {
        let pattern = Regex::new(PLACEHOLDER)?;

        let missing: BTreeSet<String> = pattern
            .captures_iter(template)
            .map(|caps| caps[1].to_string())
            .filter(|name| !values.contains_key(name))
            .collect();
        if !missing.is_empty() {
            return Err(TemplateError::MissingValues {
                names: missing.into_iter().collect(),
            });
        }

        Ok(pattern
            .replace_all(template, |caps: &Captures<'_>| values[&caps[1]].clone())
            .into_owned())
    }

    /// Renders the template at `template_path` to a new temporary file.
    ///
    /// The temporary file keeps the template's extension, since consumers
    /// often pick a parser by extension.
    pub fn render_file(
        &self,
        template_path: &Path,
        values: &TemplateValues,
    ) -> Result<RenderedConfig, TemplateError> {
        let template = std::fs::read_to_string(template_path).map_err(|source| TemplateError::Read {
            path: template_path.to_path_buf(),
            source,
        })?;
        let rendered = self.render_str(&template, values)?;

        let suffix = template_path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let mut file = tempfile::Builder::new()
            .prefix("settle-")
            .suffix(&suffix)
            .tempfile()
            .map_err(TemplateError::Write)?;
        file.write_all(rendered.as_bytes())
            .and_then(|()| file.flush())
            .map_err(TemplateError::Write)?;

        debug!(
            template = %template_path.display(),
            rendered = %file.path().display(),
            "rendered config template"
        );
        Ok(RenderedConfig { file })
    }
}
