//! Job definition templates.
//!
//! Templates are plain text files with `${{ expr }}` placeholders, where
//! `expr` is a dotted path into the job parameters, optionally followed by
//! `| json` to emit the value as JSON.

use crate::error::{Error, Result};
use crate::ports::TemplateRenderer;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([A-Za-z0-9_.\-]+)\s*(\|\s*json\s*)?\}\}").expect("valid regex")
});

/// Renders templates found on disk by substituting job parameters.
#[derive(Debug, Clone, Default)]
pub struct InterpolationRenderer;

impl InterpolationRenderer {
    pub fn new() -> Self {
        Self
    }

    /// First `search_paths` entry containing `template`.
    pub fn locate(template: &str, search_paths: &[PathBuf]) -> Option<PathBuf> {
        let direct = Path::new(template);
        if direct.is_absolute() {
            return direct.is_file().then(|| direct.to_path_buf());
        }
        search_paths
            .iter()
            .map(|dir| dir.join(template))
            .find(|candidate| candidate.is_file())
    }

    /// Substitute every placeholder in `source`.
    pub fn render_str(
        &self,
        template: &str,
        source: &str,
        params: &Map<String, Value>,
    ) -> Result<String> {
        let mut missing = None;
        let rendered = PLACEHOLDER.replace_all(source, |caps: &Captures| {
            let path = &caps[1];
            match resolve(params, path) {
                Some(value) if caps.get(2).is_some() => value.to_string(),
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) => String::new(),
                Some(value) => value.to_string(),
                None => {
                    missing.get_or_insert_with(|| path.to_string());
                    String::new()
                }
            }
        });

        match missing {
            Some(key) => Err(Error::Render {
                template: template.to_string(),
                reason: format!("undefined parameter '{}'", key),
            }),
            None => Ok(rendered.into_owned()),
        }
    }
}

impl TemplateRenderer for InterpolationRenderer {
    fn render(
        &self,
        template: &str,
        search_paths: &[PathBuf],
        params: &Map<String, Value>,
    ) -> Result<String> {
        let path = Self::locate(template, search_paths).ok_or_else(|| Error::Render {
            template: template.to_string(),
            reason: format!("not found in {:?}", search_paths),
        })?;
        debug!(template, path = %path.display(), "Rendering template");
        let source = std::fs::read_to_string(&path).map_err(|e| Error::Render {
            template: template.to_string(),
            reason: e.to_string(),
        })?;
        self.render_str(template, &source, params)
    }
}

fn resolve<'a>(params: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = params.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn params() -> Map<String, Value> {
        json!({
            "name": "baseline-arm64",
            "priority": 40,
            "platform": {"arch": "arm64", "dtb": null},
            "artifacts": {"kernel": "https://storage/Image"},
            "fragments": ["debug", "kselftest"],
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_render_scalars_and_paths() {
        let out = InterpolationRenderer::new()
            .render_str(
                "inline",
                concat!(
                    "job: ${{ name }}\narch: ${{platform.arch}}\n",
                    "prio: ${{ priority }}\nfirst: ${{ fragments.0 }}",
                ),
                &params(),
            )
            .unwrap();
        assert_eq!(out, "job: baseline-arm64\narch: arm64\nprio: 40\nfirst: debug");
    }

    #[test]
    fn test_json_filter() {
        let out = InterpolationRenderer::new()
            .render_str("inline", "${{ artifacts | json }}", &params())
            .unwrap();
        assert_eq!(out, r#"{"kernel":"https://storage/Image"}"#);
    }

    #[test]
    fn test_null_renders_empty() {
        let out = InterpolationRenderer::new()
            .render_str("inline", "dtb=${{ platform.dtb }}", &params())
            .unwrap();
        assert_eq!(out, "dtb=");
    }

    #[test]
    fn test_missing_parameter_is_render_error() {
        let err = InterpolationRenderer::new()
            .render_str("inline", "${{ platform.board }}", &params())
            .unwrap_err();
        match err {
            Error::Render { reason, .. } => assert!(reason.contains("platform.board")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_render_from_search_paths() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join("baseline.jinja2"), "name: ${{ name }}").unwrap();

        let paths = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let out = InterpolationRenderer::new()
            .render("baseline.jinja2", &paths, &params())
            .unwrap();
        assert_eq!(out, "name: baseline-arm64");

        let missing = InterpolationRenderer::new().render("other.jinja2", &paths, &params());
        assert!(matches!(missing, Err(Error::Render { .. })));
    }
}
