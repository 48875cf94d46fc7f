//! Topology rendering: DOT generation in-crate, DOT-to-SVG through an external
//! renderer collaborator.

use std::collections::BTreeSet;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use karl_core::{Error, Result, RuntimeStatus};

use crate::report::KarlStatus;

/// External renderer: a pure function from DOT text to SVG bytes.
#[async_trait]
pub trait SvgRenderer: Send + Sync {
    /// Renders DOT into an SVG document.
    async fn render_svg(&self, dot: &str) -> Result<String>;
}

/// Renders through the Graphviz `dot` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphvizRenderer;

#[async_trait]
impl SvgRenderer for GraphvizRenderer {
    async fn render_svg(&self, dot: &str) -> Result<String> {
        let mut child = tokio::process::Command::new("dot")
            .arg("-Tsvg")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::external(format!("spawn graphviz dot: {e}")))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(dot.as_bytes())
                .await
                .map_err(|e| Error::external(format!("feed graphviz dot: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::external(format!("wait for graphviz dot: {e}")))?;
        if !output.status.success() {
            return Err(Error::external(format!(
                "graphviz dot failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| Error::external(format!("graphviz dot produced non-UTF-8 output: {e}")))
    }
}

fn escape_label(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Builds the DOT rendering of a status report: one node per codename, one edge
/// per resolved dependency.
#[must_use]
pub fn render_dot<R: RuntimeStatus>(
    status: &KarlStatus<R>,
    name: &str,
    github_repo_url: &str,
) -> String {
    let mut dot = String::new();
    dot.push_str("digraph karl {\n");
    dot.push_str(&format!("  label=\"{}\";\n", escape_label(name)));
    if !github_repo_url.is_empty() {
        dot.push_str(&format!("  URL=\"{}\";\n", escape_label(github_repo_url)));
    }
    dot.push_str("  node [shape=box, style=rounded];\n");

    // Codenames are unique cluster-wide, so they double as node identifiers.
    let mut known_nodes: BTreeSet<&str> = BTreeSet::new();
    for machine in status.machines.values() {
        for (codename, service) in &machine.services {
            known_nodes.insert(codename.as_str());
            let state = if service.currently.is_up() { "up" } else { "down" };
            let color = if service.currently.is_up() {
                "darkgreen"
            } else {
                "red"
            };
            dot.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}\\n{}:{}\\n{}\", color={}];\n",
                escape_label(codename),
                escape_label(&service.service),
                escape_label(codename),
                escape_label(&service.location.ip),
                service.location.port,
                state,
                color,
            ));
        }
    }
    for machine in status.machines.values() {
        for (codename, service) in &machine.services {
            for dependency in &service.dependencies {
                if known_nodes.contains(dependency.as_str()) {
                    dot.push_str(&format!(
                        "  \"{}\" -> \"{}\";\n",
                        escape_label(codename),
                        escape_label(dependency)
                    ));
                }
            }
        }
    }
    dot.push_str("}\n");
    dot
}
