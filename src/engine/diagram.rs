//! Mermaid rendering of a flow, optionally coloured by a run's node states.

use std::collections::HashMap;
use std::fmt::Write;

use super::run::RunSnapshot;
use crate::flow::FlowDefinition;

const CLASS_DEFS: [(&str, &str); 7] = [
    ("ready", "fill:#eef,stroke:#88a"),
    ("running", "fill:#cce5ff,stroke:#004085"),
    ("succeeded", "fill:#d4edda,stroke:#28a745"),
    ("failed", "fill:#f8d7da,stroke:#dc3545"),
    ("retrying", "fill:#fff3cd,stroke:#ffc107"),
    ("skipped", "fill:#e2e3e5,stroke:#6c757d,stroke-dasharray:4"),
    ("cancelled", "fill:#e2e3e5,stroke:#343a40"),
];

/// Render `flowchart TD` source. Data edges are labelled with their port
/// names; `depends_on` edges are dotted.
pub fn render_mermaid(definition: &FlowDefinition, snapshot: Option<&RunSnapshot>) -> String {
    let ids: HashMap<&str, String> = definition
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.as_str(), format!("n{}", i)))
        .collect();

    let mut out = String::from("flowchart TD\n");

    for node in &definition.nodes {
        let id = &ids[node.name.as_str()];
        let _ = write!(
            out,
            "    {}[\"{}<br/><i>{}</i>\"]",
            id,
            escape(&node.name),
            escape(&node.node_type)
        );
        if let Some(state) = snapshot.and_then(|s| s.node_state(&node.name)) {
            let _ = write!(out, ":::{}", state.as_str());
        }
        out.push('\n');
    }

    for edge in &definition.edges {
        let (Some(from), Some(to)) = (ids.get(edge.from.as_str()), ids.get(edge.to.as_str()))
        else {
            continue;
        };
        match (&edge.output, &edge.input) {
            (Some(output), Some(input)) if output == input => {
                let _ = writeln!(out, "    {} -->|{}| {}", from, escape(output), to);
            }
            (Some(output), Some(input)) => {
                let _ = writeln!(
                    out,
                    "    {} -->|{} to {}| {}",
                    from,
                    escape(output),
                    escape(input),
                    to
                );
            }
            _ => {
                let _ = writeln!(out, "    {} -.-> {}", from, to);
            }
        }
    }

    if snapshot.is_some() {
        for (class, style) in CLASS_DEFS {
            let _ = writeln!(out, "    classDef {} {}", class, style);
        }
    }

    out
}

fn escape(text: &str) -> String {
    text.replace('"', "#quot;")
        .replace('|', "#124;")
        .replace('<', "#lt;")
        .replace('>', "#gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::run::{NodeRunState, NodeState, RunState, Trigger};
    use crate::flow::{compile_source, Edge};
    use crate::nodes::CapabilityRegistry;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn definition() -> FlowDefinition {
        let source = r#"
flow "demo" {
  node "make" { type: set, config { value: 1 } }
  node "show" { type: debug, inputs { input: any from "make.value" } }
  node "pause" { type: wait, depends_on: [show] }
}"#;
        compile_source(source, &CapabilityRegistry::new())
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_static_diagram() {
        let diagram = render_mermaid(&definition(), None);
        assert!(diagram.starts_with("flowchart TD\n"));
        assert!(diagram.contains("n0[\"make<br/><i>set</i>\"]\n"));
        assert!(diagram.contains("n0 -->|value to input| n1"));
        assert!(diagram.contains("n1 -.-> n2"));
        assert!(!diagram.contains("classDef"));
    }

    #[test]
    fn test_states_become_classes() {
        let def = definition();
        let mut node_states = BTreeMap::new();
        for (name, state) in [
            ("make", NodeState::Succeeded),
            ("show", NodeState::FAILED),
            ("pause", NodeState::Skipped),
        ] {
            let mut node = NodeRunState::new("x");
            node.state = state;
            node_states.insert(name.to_string(), node);
        }
        let snapshot = RunSnapshot {
            run_id: "r".into(),
            flow_id: "demo".into(),
            flow_version: 1,
            flow_name: "demo".into(),
            trigger: Trigger::manual(),
            state: RunState::Failed,
            node_states,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        };

        let diagram = render_mermaid(&def, Some(&snapshot));
        assert!(diagram.contains(":::succeeded"));
        assert!(diagram.contains("n1[\"show<br/><i>debug</i>\"]:::failed"));
        assert!(diagram.contains(":::skipped"));
        assert!(diagram.contains("classDef failed"));
    }

    #[test]
    fn test_labels_are_escaped() {
        let mut def = definition();
        def.nodes[0].name = "a \"quoted\" <name>".into();
        def.edges.push(Edge::control("missing", "show"));
        let diagram = render_mermaid(&def, None);
        assert!(diagram.contains("a #quot;quoted#quot; #lt;name#gt;"));
        assert!(!diagram.contains("missing"));
    }
}
