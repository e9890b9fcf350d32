//! Manifest rendering
//!
//! A thin MiniJinja pass over chart templates. Templates see `values`,
//! `release` and `chart`; partials (`_*.tpl`) are loadable through
//! `include`/`import` but never emitted. Enabled subcharts render with
//! their scoped values.

use base64::Engine as _;
use berth_core::{LoadedChart, Values};
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value};
use serde::Serialize;

use crate::error::{KubeError, Result};

/// Release information exposed to templates as `release`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseContext {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub is_install: bool,
    pub is_upgrade: bool,
    pub service: &'static str,
}

impl ReleaseContext {
    pub fn new(name: &str, namespace: &str, revision: u32) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision,
            is_install: revision <= 1,
            is_upgrade: revision > 1,
            service: "Berth",
        }
    }
}

/// Rendered chart output
#[derive(Debug, Clone, Default)]
pub struct Rendered {
    /// All documents, each preceded by a `# Source:` comment
    pub manifest: String,
    pub notes: Option<String>,
}

/// Chart metadata exposed to templates as `chart`
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChartContext<'a> {
    name: &'a str,
    version: String,
    app_version: Option<&'a str>,
}

/// Render a chart with user values layered over its defaults
pub fn render_chart(chart: &LoadedChart, values: &Values, release: &ReleaseContext) -> Result<Rendered> {
    let effective = Values::merge_with_defaults(&chart.values, values);

    let mut documents = Vec::new();
    render_into(chart, &effective, release, "", &mut documents)?;

    let notes = match chart.notes_template() {
        Some(source) => {
            let env = environment();
            let text = render_one(&env, "NOTES.txt", source, chart, &effective, release)
                .map_err(|e| KubeError::Render(format!("NOTES.txt: {}", e)))?;
            Some(text.trim().to_string()).filter(|t| !t.is_empty())
        }
        None => None,
    };

    Ok(Rendered {
        manifest: documents.join("\n"),
        notes,
    })
}

fn render_into(
    chart: &LoadedChart,
    values: &Values,
    release: &ReleaseContext,
    prefix: &str,
    documents: &mut Vec<String>,
) -> Result<()> {
    let mut env = environment();
    for (path, source) in chart.partials() {
        env.add_template_owned(path.to_string(), String::from_utf8_lossy(source).into_owned())
            .map_err(|e| KubeError::Render(format!("{}{}: {}", prefix, path, e)))?;
    }

    for (path, source) in chart.templates() {
        let rendered = render_one(&env, path, source, chart, values, release)
            .map_err(|e| KubeError::Render(format!("{}{}: {}", prefix, path, e)))?;
        let trimmed = rendered.trim();
        if trimmed.is_empty() || trimmed == "---" {
            continue;
        }
        documents.push(format!("---\n# Source: {}{}/{}\n{}", prefix, chart.name(), path, trimmed));
    }

    for dependency in &chart.metadata.dependencies {
        if !dependency.is_enabled(values) {
            tracing::debug!(subchart = %dependency.effective_name(), "subchart disabled");
            continue;
        }
        let Some(subchart) = chart.subchart_for(dependency) else {
            tracing::warn!(subchart = %dependency.name, "declared dependency is missing from charts/");
            continue;
        };
        let scoped = Values::for_subchart(&subchart.values, values, dependency.effective_name());
        let nested = format!("{}{}/charts/", prefix, chart.name());
        render_into(subchart, &scoped, release, &nested, documents)?;
    }

    Ok(())
}

fn render_one(
    env: &Environment<'static>,
    name: &str,
    source: &[u8],
    chart: &LoadedChart,
    values: &Values,
    release: &ReleaseContext,
) -> std::result::Result<String, Error> {
    let source = String::from_utf8_lossy(source);
    let template = env.template_from_named_str(name, &source)?;

    let chart_ctx = ChartContext {
        name: chart.name(),
        version: chart.metadata.version.to_string(),
        app_version: chart.metadata.app_version.as_deref(),
    };
    let ctx = minijinja::context! {
        values => values.inner(),
        release => release,
        chart => chart_ctx,
    };

    template.render(ctx)
}

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.set_trim_blocks(true);
    env.add_filter("toyaml", toyaml);
    env.add_filter("tojson", tojson);
    env.add_filter("b64encode", b64encode);
    env.add_filter("quote", quote);
    env.add_filter("nindent", nindent);
    env.add_filter("required", required);
    env
}

fn toyaml(value: Value) -> std::result::Result<String, Error> {
    let json: serde_json::Value = serde_json::to_value(&value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    let yaml = serde_yaml::to_string(&json)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    Ok(yaml.trim_start_matches("---\n").trim_end().to_string())
}

fn tojson(value: Value) -> std::result::Result<String, Error> {
    let json: serde_json::Value = serde_json::to_value(&value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    serde_json::to_string(&json).map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

fn b64encode(value: String) -> String {
    base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
}

fn quote(value: Value) -> String {
    let raw = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Newline, then every non-empty line indented
fn nindent(value: String, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    let body = value
        .lines()
        .map(|line| if line.is_empty() { String::new() } else { format!("{}{}", pad, line) })
        .collect::<Vec<_>>()
        .join("\n");
    format!("\n{}", body)
}

fn required(value: Value, message: Option<String>) -> std::result::Result<Value, Error> {
    if value.is_undefined() || value.is_none() {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            message.unwrap_or_else(|| "required value is missing".to_string()),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn chart(files: &[(&str, &str)]) -> LoadedChart {
        let map: BTreeMap<String, Vec<u8>> = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
            .collect();
        LoadedChart::from_files(map).unwrap()
    }

    #[test]
    fn test_render_values_and_release() {
        let chart = chart(&[
            ("Chart.yaml", "name: web\nversion: 1.0.0\n"),
            ("values.yaml", "replicaCount: 1\nimage:\n  tag: stable\n"),
            (
                "templates/deploy.yaml",
                "kind: Deployment\nmetadata:\n  name: {{ release.name }}\nspec:\n  replicas: {{ values.replicaCount }}\n  image: {{ values.image.tag | quote }}\n",
            ),
            ("templates/NOTES.txt", "Installed {{ chart.name }} {{ chart.version }}"),
        ]);

        let values = Values::from_yaml("replicaCount: 3").unwrap();
        let out = render_chart(&chart, &values, &ReleaseContext::new("prod", "apps", 1)).unwrap();

        assert!(out.manifest.contains("# Source: web/templates/deploy.yaml"));
        assert!(out.manifest.contains("name: prod"));
        assert!(out.manifest.contains("replicas: 3"));
        assert!(out.manifest.contains("image: \"stable\""));
        assert_eq!(out.notes.as_deref(), Some("Installed web 1.0.0"));
    }

    #[test]
    fn test_partials_not_emitted_and_empty_skipped() {
        let chart = chart(&[
            ("Chart.yaml", "name: web\nversion: 1.0.0\n"),
            ("templates/_helpers.tpl", "{% macro label() %}app: web{% endmacro %}"),
            (
                "templates/cm.yaml",
                "{% from 'templates/_helpers.tpl' import label %}kind: ConfigMap\nmetadata:\n  labels:\n    {{ label() }}\n",
            ),
            ("templates/off.yaml", "{% if values.enabled %}kind: Secret{% endif %}"),
        ]);

        let out = render_chart(&chart, &Values::new(), &ReleaseContext::new("r", "default", 1)).unwrap();
        assert!(out.manifest.contains("app: web"));
        assert!(!out.manifest.contains("_helpers"));
        assert!(!out.manifest.contains("off.yaml"));
        assert_eq!(out.notes, None);
    }

    #[test]
    fn test_subchart_scoping_and_condition() {
        let mut parent = chart(&[
            (
                "Chart.yaml",
                "name: app\nversion: 1.0.0\ndependencies:\n  - name: cache\n    version: 1.0.0\n    condition: cache.enabled\n",
            ),
            ("values.yaml", "cache:\n  enabled: true\n  size: 2\n"),
            ("templates/app.yaml", "kind: Service\n"),
        ]);
        parent.dependencies.push(chart(&[
            ("Chart.yaml", "name: cache\nversion: 1.0.0\n"),
            ("values.yaml", "size: 1\n"),
            ("templates/sts.yaml", "kind: StatefulSet\nreplicas: {{ values.size }}\n"),
        ]));

        let out = render_chart(&parent, &Values::new(), &ReleaseContext::new("r", "default", 1)).unwrap();
        assert!(out.manifest.contains("# Source: app/charts/cache/templates/sts.yaml"));
        assert!(out.manifest.contains("replicas: 2"));

        let disabled = Values::from_yaml("cache:\n  enabled: false\n").unwrap();
        let out = render_chart(&parent, &disabled, &ReleaseContext::new("r", "default", 1)).unwrap();
        assert!(!out.manifest.contains("StatefulSet"));
    }

    #[test]
    fn test_required_filter_fails() {
        let chart = chart(&[
            ("Chart.yaml", "name: web\nversion: 1.0.0\n"),
            ("templates/cm.yaml", "host: {{ values.host | required('host is required') }}\n"),
        ]);
        let err = render_chart(&chart, &Values::new(), &ReleaseContext::new("r", "default", 1)).unwrap_err();
        assert!(matches!(err, KubeError::Render(_)));
        assert!(err.to_string().contains("host is required"));
    }

    #[test]
    fn test_filters() {
        assert_eq!(b64encode("hi".into()), "aGk=");
        assert_eq!(nindent("a\n\nb".into(), 2), "\n  a\n\n  b");
        assert_eq!(quote(Value::from("say \"hi\"")), "\"say \\\"hi\\\"\"");
        assert_eq!(
            toyaml(Value::from_serialize(serde_json::json!({"a": 1}))).unwrap(),
            "a: 1"
        );
    }
}
