//! Semantic validation: turns a parsed [`Program`] into executable
//! [`FlowDefinition`]s.
//!
//! Problems are collected as diagnostics rather than returned as errors, so a
//! single pass reports everything wrong with a file. Only a dependency cycle
//! is fatal for its flow; other errors leave out the offending piece and keep
//! going.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::{Map, Number, Value as Json};
use tracing::debug;

use super::types::{
    parse_duration, types_compatible, Edge, FlowConfig, FlowDefinition, InputSpec, NodeSpec,
    PortRef, RetryPolicy,
};
use crate::dsl::ast::{
    Assignment, BindingKeyword, Flow, FlowNode, NodeId, PortDecl, PortDirection, Program,
    Statement, Value,
};
use crate::dsl::{parse, Diagnostic, DiagnosticCode, Diagnostics};
use crate::nodes::{CapabilityDescriptor, CapabilityRegistry};

/// Output of a compile pass.
#[derive(Debug, Clone, Default)]
pub struct Compilation {
    pub flows: Vec<FlowDefinition>,
    pub diagnostics: Diagnostics,
}

impl Compilation {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.has_errors()
    }

    pub fn flow(&self, name: &str) -> Option<&FlowDefinition> {
        self.flows.iter().find(|f| f.name == name)
    }
}

/// Compiler bound to a capability registry and a set of flow defaults.
pub struct Compiler<'r> {
    registry: &'r CapabilityRegistry,
    defaults: FlowConfig,
}

impl<'r> Compiler<'r> {
    pub fn new(registry: &'r CapabilityRegistry) -> Self {
        Self {
            registry,
            defaults: FlowConfig::default(),
        }
    }

    /// Values used for settings a flow's `config {}` block leaves out.
    pub fn with_defaults(mut self, defaults: FlowConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn compile(&self, program: &Program) -> Compilation {
        let mut diagnostics = Diagnostics::new();
        let mut flows = Vec::new();
        let mut seen = HashSet::new();

        for flow in &program.flows {
            if !seen.insert(flow.name.value.as_str()) {
                diagnostics.push(
                    Diagnostic::error(
                        DiagnosticCode::DuplicateFlow,
                        format!("duplicate flow name '{}'", flow.name.value),
                    )
                    .at(program.position(flow.name.id)),
                );
                continue;
            }

            let mut builder = FlowBuilder {
                program,
                registry: self.registry,
                diagnostics: &mut diagnostics,
            };
            if let Some(definition) = builder.build(flow, &self.defaults) {
                debug!(
                    flow = %definition.name,
                    nodes = definition.nodes.len(),
                    edges = definition.edges.len(),
                    "Compiled flow"
                );
                flows.push(definition);
            }
        }

        Compilation { flows, diagnostics }
    }
}

/// Compile every flow in a program.
pub fn compile(program: &Program, registry: &CapabilityRegistry) -> Compilation {
    Compiler::new(registry).compile(program)
}

/// Parse and compile source text. Fails with every diagnostic (syntax and
/// semantic) if any of them is an error.
pub fn compile_source(
    source: &str,
    registry: &CapabilityRegistry,
) -> std::result::Result<Vec<FlowDefinition>, Diagnostics> {
    compile_source_with(&Compiler::new(registry), source)
}

pub fn compile_source_with(
    compiler: &Compiler<'_>,
    source: &str,
) -> std::result::Result<Vec<FlowDefinition>, Diagnostics> {
    let (program, parse_diagnostics) = parse(source);
    let compilation = compiler.compile(&program);

    let mut diagnostics = Diagnostics::from(parse_diagnostics);
    diagnostics.extend(compilation.diagnostics);

    if diagnostics.has_errors() {
        Err(diagnostics)
    } else {
        Ok(compilation.flows)
    }
}

/// Pick a flow by name, or the first one when no name is given.
pub fn select_flow(
    flows: Vec<FlowDefinition>,
    name: Option<&str>,
) -> crate::error::Result<FlowDefinition> {
    match name {
        Some(name) => flows
            .into_iter()
            .find(|f| f.name == name)
            .ok_or_else(|| crate::error::Error::Validation(format!("No flow named '{}'", name))),
        None => flows
            .into_iter()
            .next()
            .ok_or_else(|| crate::error::Error::Validation("Source contains no flows".to_string())),
    }
}

// ============================================================================
// Per-flow compilation
// ============================================================================

/// A node that survived declaration checks, before binding resolution.
struct NodeDraft<'a> {
    name: String,
    decl: &'a FlowNode,
    node_type: String,
    descriptor: CapabilityDescriptor,
    config: Map<String, Json>,
    policy: RetryPolicy,
    depends_on: Vec<(String, NodeId)>,
    inputs: Vec<&'a PortDecl>,
    outputs: Vec<&'a PortDecl>,
    outputs_declared: bool,
}

/// Input binding after `from`/`to` processing.
struct PendingInput {
    value_type: String,
    required: bool,
    source: Option<(PortRef, NodeId)>,
    /// Binding referenced a node that was already rejected
    poisoned: bool,
}

struct FlowBuilder<'a, 'd> {
    program: &'a Program,
    registry: &'a CapabilityRegistry,
    diagnostics: &'d mut Diagnostics,
}

impl<'a> FlowBuilder<'a, '_> {
    fn error(&mut self, code: DiagnosticCode, message: String, at: NodeId) {
        self.diagnostics
            .push(Diagnostic::error(code, message).at(self.program.position(at)));
    }

    fn warn(&mut self, code: DiagnosticCode, message: String, at: NodeId) {
        self.diagnostics
            .push(Diagnostic::warning(code, message).at(self.program.position(at)));
    }

    fn build(&mut self, flow: &'a Flow, defaults: &FlowConfig) -> Option<FlowDefinition> {
        let name = flow.name.value.clone();
        if name.trim().is_empty() {
            self.error(
                DiagnosticCode::InvalidValue,
                "flow name cannot be empty".to_string(),
                flow.name.id,
            );
        }

        let mut description = String::new();
        let mut config = defaults.clone();
        let mut config_keys = HashSet::new();
        let mut flow_keys = HashSet::new();
        let mut node_decls = Vec::new();

        for statement in &flow.body.statements {
            match statement {
                Statement::Assignment(a) => {
                    self.check_duplicate(&mut flow_keys, a);
                    if a.key.name == "description" {
                        match &a.value {
                            Value::String(s) => description = s.value.clone(),
                            other => self.error(
                                DiagnosticCode::InvalidValue,
                                format!("description must be a string, found {}", other.kind_name()),
                                other.id(),
                            ),
                        }
                    } else {
                        self.error(
                            DiagnosticCode::UnknownAttribute,
                            format!(
                                "unknown flow attribute '{}' (expected description, config or node)",
                                a.key.name
                            ),
                            a.key.id,
                        );
                    }
                }
                Statement::Config(block) => {
                    for inner in &block.body.statements {
                        match inner {
                            Statement::Assignment(a) => {
                                self.check_duplicate(&mut config_keys, a);
                                self.apply_flow_setting(&mut config, a);
                            }
                            other => self.error(
                                DiagnosticCode::UnknownAttribute,
                                "only key: value settings are allowed in a config block"
                                    .to_string(),
                                other.id(),
                            ),
                        }
                    }
                }
                Statement::Node(node) => node_decls.push(node),
                Statement::Ports(ports) => self.error(
                    DiagnosticCode::UnknownAttribute,
                    format!("'{}' is only allowed inside a node", ports.direction.keyword()),
                    ports.id,
                ),
            }
        }

        // Declarations
        let mut drafts: Vec<NodeDraft<'a>> = Vec::new();
        let mut rejected: HashSet<String> = HashSet::new();
        let mut declared: HashSet<String> = HashSet::new();
        for node in node_decls {
            if !declared.insert(node.name.value.clone()) {
                self.error(
                    DiagnosticCode::DuplicateNode,
                    format!("duplicate node name '{}' in flow '{}'", node.name.value, name),
                    node.name.id,
                );
                continue;
            }
            match self.declare_node(node, &config) {
                Some(draft) => drafts.push(draft),
                None => {
                    rejected.insert(node.name.value.clone());
                }
            }
        }

        // Visible outputs, and `to` bindings they carry
        let mut outputs: HashMap<String, BTreeMap<String, String>> = HashMap::new();
        let mut pushed: Vec<(String, String, PortRef, NodeId)> = Vec::new();
        for draft in &drafts {
            let visible = self.resolve_outputs(draft, &mut pushed);
            outputs.insert(draft.name.clone(), visible);
        }

        // Inputs
        let mut inputs: HashMap<String, BTreeMap<String, PendingInput>> = drafts
            .iter()
            .map(|d| (d.name.clone(), self.declare_inputs(d)))
            .collect();

        for (producer, output, target, at) in pushed {
            self.apply_push(&drafts, &rejected, &mut inputs, &producer, &output, target, at);
        }

        let mut nodes = Vec::with_capacity(drafts.len());
        let mut edges = Vec::new();
        for draft in &drafts {
            let pending = inputs.remove(&draft.name).unwrap_or_default();
            let resolved = self.resolve_inputs(draft, pending, &outputs, &rejected, &mut edges);

            let mut depends_on = Vec::new();
            for (dep, at) in &draft.depends_on {
                if rejected.contains(dep) || depends_on.contains(dep) {
                    continue;
                }
                if !outputs.contains_key(dep) {
                    self.error(
                        DiagnosticCode::UnresolvedReference,
                        format!("node '{}' depends on unknown node '{}'", draft.name, dep),
                        *at,
                    );
                    continue;
                }
                edges.push(Edge::control(dep, &draft.name));
                depends_on.push(dep.clone());
            }

            nodes.push(NodeSpec {
                name: draft.name.clone(),
                node_type: draft.node_type.clone(),
                inputs: resolved,
                outputs: outputs.get(&draft.name).cloned().unwrap_or_default(),
                config: Json::Object(draft.config.clone()),
                depends_on,
                policy: draft.policy,
            });
        }

        let definition = FlowDefinition {
            id: name.clone(),
            name,
            description,
            version: 1,
            config,
            nodes,
            edges,
        };

        if let Some(cycle) = definition.graph().find_cycle() {
            self.error(
                DiagnosticCode::DependencyCycle,
                format!(
                    "dependency cycle in flow '{}': {}",
                    definition.name,
                    cycle.join(" -> ")
                ),
                flow.name.id,
            );
            return None;
        }

        Some(definition)
    }

    fn check_duplicate(&mut self, seen: &mut HashSet<String>, a: &Assignment) {
        if !seen.insert(a.key.name.clone()) {
            self.warn(
                DiagnosticCode::DuplicateKey,
                format!("duplicate key '{}', the last value wins", a.key.name),
                a.key.id,
            );
        }
    }

    fn apply_flow_setting(&mut self, config: &mut FlowConfig, a: &Assignment) {
        match a.key.name.as_str() {
            "retries" => {
                if let Some(retries) = self.count(&a.value, "retries") {
                    config.retries = retries;
                }
            }
            "timeout" => {
                if let Some(timeout) = self.duration(&a.value, "timeout") {
                    config.timeout = (!timeout.is_zero()).then_some(timeout);
                }
            }
            "backoff" => {
                if let Some(backoff) = self.duration(&a.value, "backoff") {
                    config.backoff = backoff;
                }
            }
            "max_backoff" => {
                if let Some(cap) = self.duration(&a.value, "max_backoff") {
                    config.max_backoff = cap;
                }
            }
            other => self.error(
                DiagnosticCode::UnknownAttribute,
                format!(
                    "unknown config key '{}' (expected retries, timeout, backoff or max_backoff)",
                    other
                ),
                a.key.id,
            ),
        }
    }

    fn count(&mut self, value: &Value, key: &str) -> Option<u32> {
        if let Value::Number(n) = value {
            if n.value >= 0.0 && n.value.fract() == 0.0 && n.value <= u32::MAX as f64 {
                return Some(n.value as u32);
            }
        }
        self.error(
            DiagnosticCode::InvalidValue,
            format!("{} must be a non-negative integer, found {}", key, value),
            value.id(),
        );
        None
    }

    fn duration(&mut self, value: &Value, key: &str) -> Option<std::time::Duration> {
        match parse_duration(&to_json(value)) {
            Ok(d) => Some(d),
            Err(e) => {
                self.error(
                    DiagnosticCode::InvalidValue,
                    format!("invalid {}: {}", key, e),
                    value.id(),
                );
                None
            }
        }
    }

    fn declare_node(&mut self, node: &'a FlowNode, flow_config: &FlowConfig) -> Option<NodeDraft<'a>> {
        let name = node.name.value.clone();
        if name.trim().is_empty() {
            self.error(
                DiagnosticCode::InvalidValue,
                "node name cannot be empty".to_string(),
                node.name.id,
            );
            return None;
        }

        let mut node_type: Option<(String, NodeId)> = None;
        let mut config = Map::new();
        let mut policy = flow_config.policy();
        let mut depends_on = Vec::new();
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut outputs_declared = false;
        let mut keys = HashSet::new();
        let mut config_keys = HashSet::new();

        for statement in &node.body.statements {
            match statement {
                Statement::Assignment(a) => {
                    self.check_duplicate(&mut keys, a);
                    match a.key.name.as_str() {
                        "type" => match &a.value {
                            Value::Identifier(i) => node_type = Some((i.name.clone(), i.id)),
                            Value::String(s) => node_type = Some((s.value.clone(), s.id)),
                            other => self.error(
                                DiagnosticCode::InvalidValue,
                                format!("node type must be a name, found {}", other.kind_name()),
                                other.id(),
                            ),
                        },
                        "depends_on" => self.collect_dependencies(&a.value, &mut depends_on),
                        other => self.error(
                            DiagnosticCode::UnknownAttribute,
                            format!(
                                "unknown attribute '{}' on node '{}' (expected type, depends_on, config, inputs or outputs)",
                                other, name
                            ),
                            a.key.id,
                        ),
                    }
                }
                Statement::Config(block) => {
                    for inner in &block.body.statements {
                        let Statement::Assignment(a) = inner else {
                            self.error(
                                DiagnosticCode::UnknownAttribute,
                                "only key: value settings are allowed in a config block"
                                    .to_string(),
                                inner.id(),
                            );
                            continue;
                        };
                        self.check_duplicate(&mut config_keys, a);
                        match a.key.name.as_str() {
                            "retries" => {
                                if let Some(retries) = self.count(&a.value, "retries") {
                                    policy.retries = retries;
                                }
                            }
                            "timeout" => {
                                if let Some(timeout) = self.duration(&a.value, "timeout") {
                                    policy.timeout = (!timeout.is_zero()).then_some(timeout);
                                }
                            }
                            key => {
                                config.insert(key.to_string(), to_json(&a.value));
                            }
                        }
                    }
                }
                Statement::Ports(ports) => match ports.direction {
                    PortDirection::Inputs => inputs.extend(ports.ports.iter()),
                    PortDirection::Outputs => {
                        outputs_declared = true;
                        outputs.extend(ports.ports.iter());
                    }
                },
                Statement::Node(inner) => self.error(
                    DiagnosticCode::UnknownAttribute,
                    format!("node '{}' cannot contain another node", name),
                    inner.id,
                ),
            }
        }

        let Some((node_type, type_id)) = node_type else {
            self.error(
                DiagnosticCode::MissingType,
                format!("node '{}' has no type", name),
                node.name.id,
            );
            return None;
        };

        let Some(descriptor) = self.registry.descriptor(&node_type).cloned() else {
            self.error(
                DiagnosticCode::UnknownType,
                format!("unknown node type '{}' for node '{}'", node_type, name),
                type_id,
            );
            return None;
        };

        Some(NodeDraft {
            name,
            decl: node,
            node_type,
            descriptor,
            config,
            policy,
            depends_on,
            inputs,
            outputs,
            outputs_declared,
        })
    }

    fn collect_dependencies(&mut self, value: &Value, into: &mut Vec<(String, NodeId)>) {
        match value {
            Value::Identifier(i) => into.push((i.name.clone(), i.id)),
            Value::String(s) => into.push((s.value.clone(), s.id)),
            Value::List(list) => {
                for item in &list.items {
                    self.collect_dependencies(item, into);
                }
            }
            Value::Number(n) => self.error(
                DiagnosticCode::InvalidValue,
                format!("depends_on expects node names, found number {}", n),
                n.id,
            ),
        }
    }

    fn resolve_outputs(
        &mut self,
        draft: &NodeDraft<'a>,
        pushed: &mut Vec<(String, String, PortRef, NodeId)>,
    ) -> BTreeMap<String, String> {
        if !draft.outputs_declared {
            return draft
                .descriptor
                .outputs
                .iter()
                .map(|p| (p.name.clone(), p.value_type.clone()))
                .collect();
        }

        let mut visible = BTreeMap::new();
        for decl in &draft.outputs {
            let Some(port) = draft.descriptor.find_output(&decl.name.name) else {
                self.error(
                    DiagnosticCode::UnknownPort,
                    format!(
                        "node '{}' (type {}) has no output '{}'",
                        draft.name, draft.node_type, decl.name.name
                    ),
                    decl.name.id,
                );
                continue;
            };
            if !types_compatible(&decl.value_type.name, &port.value_type) {
                self.error(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "output '{}' of node '{}' is {}, declared as {}",
                        decl.name.name, draft.name, port.value_type, decl.value_type.name
                    ),
                    decl.value_type.id,
                );
                continue;
            }
            visible.insert(decl.name.name.clone(), decl.value_type.name.clone());

            if let Some(binding) = &decl.binding {
                if binding.keyword != BindingKeyword::To {
                    self.error(
                        DiagnosticCode::InvalidValue,
                        format!("output '{}' binds with 'to', not 'from'", decl.name.name),
                        binding.target.id,
                    );
                    continue;
                }
                match PortRef::parse(&binding.target.value) {
                    Some(target) => pushed.push((
                        draft.name.clone(),
                        decl.name.name.clone(),
                        target,
                        binding.target.id,
                    )),
                    None => self.error(
                        DiagnosticCode::InvalidValue,
                        format!(
                            "binding target '{}' must be written \"node.input\"",
                            binding.target.value
                        ),
                        binding.target.id,
                    ),
                }
            }
        }
        visible
    }

    fn declare_inputs(&mut self, draft: &NodeDraft<'a>) -> BTreeMap<String, PendingInput> {
        let mut pending = BTreeMap::new();

        for decl in &draft.inputs {
            let name = &decl.name.name;
            let Some(port) = draft.descriptor.find_input(name) else {
                self.error(
                    DiagnosticCode::UnknownPort,
                    format!(
                        "node '{}' (type {}) has no input '{}'",
                        draft.name, draft.node_type, name
                    ),
                    decl.name.id,
                );
                continue;
            };
            if !types_compatible(&decl.value_type.name, &port.value_type) {
                self.error(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "input '{}' of node '{}' is {}, declared as {}",
                        name, draft.name, port.value_type, decl.value_type.name
                    ),
                    decl.value_type.id,
                );
                continue;
            }
            if pending.contains_key(name) {
                self.error(
                    DiagnosticCode::DuplicateBinding,
                    format!("input '{}' of node '{}' is declared twice", name, draft.name),
                    decl.name.id,
                );
                continue;
            }

            let source = match &decl.binding {
                None => None,
                Some(binding) if binding.keyword == BindingKeyword::From => {
                    match PortRef::parse(&binding.target.value) {
                        Some(r) => Some((r, binding.target.id)),
                        None => {
                            self.error(
                                DiagnosticCode::InvalidValue,
                                format!(
                                    "binding source '{}' must be written \"node.output\"",
                                    binding.target.value
                                ),
                                binding.target.id,
                            );
                            continue;
                        }
                    }
                }
                Some(binding) => {
                    self.error(
                        DiagnosticCode::InvalidValue,
                        format!("input '{}' binds with 'from', not 'to'", name),
                        binding.target.id,
                    );
                    continue;
                }
            };

            pending.insert(
                name.clone(),
                PendingInput {
                    value_type: decl.value_type.name.clone(),
                    required: port.required,
                    source,
                    poisoned: false,
                },
            );
        }

        // Required inputs take part in binding even when not declared
        for port in draft.descriptor.inputs.iter().filter(|p| p.required) {
            pending
                .entry(port.name.clone())
                .or_insert_with(|| PendingInput {
                    value_type: port.value_type.clone(),
                    required: true,
                    source: None,
                    poisoned: false,
                });
        }

        pending
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_push(
        &mut self,
        drafts: &[NodeDraft<'a>],
        rejected: &HashSet<String>,
        inputs: &mut HashMap<String, BTreeMap<String, PendingInput>>,
        producer: &str,
        output: &str,
        target: PortRef,
        at: NodeId,
    ) {
        if rejected.contains(&target.node) {
            return;
        }
        let Some(consumer) = drafts.iter().find(|d| d.name == target.node) else {
            self.error(
                DiagnosticCode::UnresolvedReference,
                format!(
                    "output '{}' of node '{}' is bound to unknown node '{}'",
                    output, producer, target.node
                ),
                at,
            );
            return;
        };
        let Some(port) = consumer.descriptor.find_input(&target.port) else {
            self.error(
                DiagnosticCode::UnknownPort,
                format!(
                    "node '{}' (type {}) has no input '{}'",
                    consumer.name, consumer.node_type, target.port
                ),
                at,
            );
            return;
        };

        let source = PortRef {
            node: producer.to_string(),
            port: output.to_string(),
        };
        let slot = inputs.entry(consumer.name.clone()).or_default();
        match slot.get_mut(&target.port) {
            Some(existing) if existing.source.is_some() => {
                self.error(
                    DiagnosticCode::DuplicateBinding,
                    format!(
                        "input '{}' of node '{}' is bound more than once",
                        target.port, consumer.name
                    ),
                    at,
                );
            }
            Some(existing) => existing.source = Some((source, at)),
            None => {
                slot.insert(
                    target.port.clone(),
                    PendingInput {
                        value_type: port.value_type.clone(),
                        required: port.required,
                        source: Some((source, at)),
                        poisoned: false,
                    },
                );
            }
        }
    }

    fn resolve_inputs(
        &mut self,
        draft: &NodeDraft<'a>,
        pending: BTreeMap<String, PendingInput>,
        outputs: &HashMap<String, BTreeMap<String, String>>,
        rejected: &HashSet<String>,
        edges: &mut Vec<Edge>,
    ) -> BTreeMap<String, InputSpec> {
        let mut resolved = BTreeMap::new();

        for (input, mut spec) in pending {
            let source = match spec.source.take() {
                Some((source, at)) => {
                    let bound = self.check_explicit(draft, &input, &spec, source, at, outputs, rejected);
                    spec.poisoned = bound.is_none();
                    bound
                }
                None => self.find_implicit(draft, &input, &spec, outputs),
            };

            if source.is_none() && spec.required && !spec.poisoned {
                self.error(
                    DiagnosticCode::UnboundInput,
                    format!(
                        "required input '{}' of node '{}' is not bound to any output",
                        input, draft.name
                    ),
                    draft.decl.name.id,
                );
            }

            if let Some(source) = &source {
                edges.push(Edge::data(source, &draft.name, &input));
            }
            resolved.insert(
                input,
                InputSpec {
                    value_type: spec.value_type,
                    source,
                },
            );
        }

        resolved
    }

    #[allow(clippy::too_many_arguments)]
    fn check_explicit(
        &mut self,
        draft: &NodeDraft<'a>,
        input: &str,
        spec: &PendingInput,
        source: PortRef,
        at: NodeId,
        outputs: &HashMap<String, BTreeMap<String, String>>,
        rejected: &HashSet<String>,
    ) -> Option<PortRef> {
        if rejected.contains(&source.node) {
            return None;
        }
        let Some(producer) = outputs.get(&source.node) else {
            self.error(
                DiagnosticCode::UnresolvedReference,
                format!(
                    "input '{}' of node '{}' references unknown node '{}'",
                    input, draft.name, source.node
                ),
                at,
            );
            return None;
        };
        let Some(output_type) = producer.get(&source.port) else {
            self.error(
                DiagnosticCode::UnresolvedReference,
                format!(
                    "input '{}' of node '{}' references missing output '{}'",
                    input, draft.name, source
                ),
                at,
            );
            return None;
        };
        if !types_compatible(output_type, &spec.value_type) {
            self.error(
                DiagnosticCode::TypeMismatch,
                format!(
                    "cannot bind {} output '{}' to {} input '{}' of node '{}'",
                    output_type, source, spec.value_type, input, draft.name
                ),
                at,
            );
            return None;
        }
        Some(source)
    }

    fn find_implicit(
        &mut self,
        draft: &NodeDraft<'a>,
        input: &str,
        spec: &PendingInput,
        outputs: &HashMap<String, BTreeMap<String, String>>,
    ) -> Option<PortRef> {
        let mut producers: Vec<&str> = outputs
            .iter()
            .filter(|(node, ports)| **node != draft.name && ports.contains_key(input))
            .map(|(node, _)| node.as_str())
            .collect();
        producers.sort_unstable();

        match producers.as_slice() {
            [] => None,
            [producer] => {
                let output_type = &outputs[*producer][input];
                if !types_compatible(output_type, &spec.value_type) {
                    self.error(
                        DiagnosticCode::TypeMismatch,
                        format!(
                            "input '{}' of node '{}' is {}, but its producer '{}' outputs {}",
                            input, draft.name, spec.value_type, producer, output_type
                        ),
                        draft.decl.name.id,
                    );
                    return None;
                }
                Some(PortRef {
                    node: producer.to_string(),
                    port: input.to_string(),
                })
            }
            many => {
                self.error(
                    DiagnosticCode::AmbiguousBinding,
                    format!(
                        "input '{}' of node '{}' could bind to any of {}; add `from \"node.{}\"`",
                        input,
                        draft.name,
                        many.join(", "),
                        input
                    ),
                    draft.decl.name.id,
                );
                None
            }
        }
    }
}

/// Convert a literal to JSON. The bare names `true`, `false` and `null` map to
/// their JSON values; other identifiers become strings.
pub fn to_json(value: &Value) -> Json {
    match value {
        Value::String(s) => Json::String(s.value.clone()),
        Value::Number(n) => {
            let integral = !n.literal.contains('.') && n.value.abs() < i64::MAX as f64;
            if integral {
                Json::from(n.value as i64)
            } else {
                Number::from_f64(n.value).map(Json::Number).unwrap_or(Json::Null)
            }
        }
        Value::Identifier(i) => match i.name.as_str() {
            "true" => Json::Bool(true),
            "false" => Json::Bool(false),
            "null" => Json::Null,
            other => Json::String(other.to_string()),
        },
        Value::List(list) => Json::Array(list.items.iter().map(to_json).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::Position;
    use crate::nodes::{Capability, NodeContext, NodeOutput};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    // ========================================================================
    // Test capabilities with typed ports
    // ========================================================================

    struct Typed(CapabilityDescriptor);

    #[async_trait]
    impl Capability for Typed {
        fn descriptor(&self) -> &CapabilityDescriptor {
            &self.0
        }

        async fn run(&self, _ctx: &NodeContext) -> crate::error::Result<NodeOutput> {
            Ok(NodeOutput::empty())
        }
    }

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new()
            .with(Arc::new(Typed(
                CapabilityDescriptor::new("csv")
                    .optional_input("path", "text")
                    .output("rows", "table"),
            )))
            .with(Arc::new(Typed(
                CapabilityDescriptor::new("filter")
                    .input("rows", "table")
                    .output("kept", "table"),
            )))
            .with(Arc::new(Typed(
                CapabilityDescriptor::new("report")
                    .input("kept", "table")
                    .optional_input("title", "text"),
            )))
    }

    fn compile_ok(source: &str) -> Vec<FlowDefinition> {
        match compile_source(source, &registry()) {
            Ok(flows) => flows,
            Err(diagnostics) => panic!("unexpected diagnostics:\n{}", diagnostics),
        }
    }

    fn compile_err(source: &str) -> Diagnostics {
        match compile_source(source, &registry()) {
            Ok(_) => panic!("expected diagnostics"),
            Err(diagnostics) => diagnostics,
        }
    }

    fn codes(diagnostics: &Diagnostics) -> Vec<DiagnosticCode> {
        diagnostics.errors().map(|d| d.code).collect()
    }

    #[test]
    fn test_config_only_flow() {
        let flows = compile_ok(r#"flow "t" { config { retries: 3 } }"#);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].name, "t");
        assert_eq!(flows[0].config.retries, 3);
        assert!(flows[0].nodes.is_empty());
        assert!(flows[0].edges.is_empty());
    }

    #[test]
    fn test_flow_settings() {
        let flows = compile_ok(
            r#"flow "t" {
                 description: "nightly"
                 config { timeout: "2m", backoff: "250ms", max_backoff: 4 }
               }"#,
        );
        let flow = &flows[0];
        assert_eq!(flow.description, "nightly");
        assert_eq!(flow.config.timeout, Some(Duration::from_secs(120)));
        assert_eq!(flow.config.backoff, Duration::from_millis(250));
        assert_eq!(flow.config.max_backoff, Duration::from_secs(4));
    }

    #[test]
    fn test_zero_timeout_disables_timeout() {
        let flows = compile_ok(r#"flow "t" { config { timeout: 0 } }"#);
        assert_eq!(flows[0].config.timeout, None);
    }

    #[test]
    fn test_bad_settings_report_and_continue() {
        let diagnostics = compile_err(
            r#"flow "t" { config { retries: -1, timeout: "soon", colour: red } }"#,
        );
        assert_eq!(
            codes(&diagnostics),
            vec![
                DiagnosticCode::InvalidValue,
                DiagnosticCode::InvalidValue,
                DiagnosticCode::UnknownAttribute
            ]
        );
    }

    #[test]
    fn test_oversized_durations_are_diagnosed() {
        let diagnostics = compile_err(
            r#"flow "t" {
                 config { timeout: 99999999999999999999999999, backoff: "1e30s" }
                 node "a" { type: set, config { timeout: "1e300h" } }
               }"#,
        );
        assert_eq!(
            codes(&diagnostics),
            vec![
                DiagnosticCode::InvalidValue,
                DiagnosticCode::InvalidValue,
                DiagnosticCode::InvalidValue
            ]
        );
        assert!(diagnostics.errors().all(|d| d.message.contains("too large")));
    }

    #[test]
    fn test_duplicate_key_warns_last_wins() {
        let (program, _) = parse(r#"flow "t" { config { retries: 1, retries: 2 } }"#);
        let compilation = compile(&program, &registry());
        assert!(!compilation.has_errors());
        assert_eq!(compilation.diagnostics.warnings().count(), 1);
        assert_eq!(compilation.flows[0].config.retries, 2);
    }

    #[test]
    fn test_explicit_and_implicit_bindings() {
        let flows = compile_ok(
            r#"
flow "etl" {
  node "extract" {
    type: csv
    config { path: "in.csv" }
  }
  node "clean" {
    type: filter
    inputs { rows: table from "extract.rows" }
  }
  node "publish" {
    type: report
    inputs { kept: table }
  }
}"#,
        );
        let flow = &flows[0];
        let clean = flow.node("clean").unwrap();
        assert_eq!(
            clean.inputs["rows"].source,
            Some(PortRef {
                node: "extract".into(),
                port: "rows".into()
            })
        );
        let publish = flow.node("publish").unwrap();
        assert_eq!(publish.inputs["kept"].source.as_ref().unwrap().node, "clean");
        assert_eq!(flow.node("extract").unwrap().config, json!({"path": "in.csv"}));

        assert!(flow.edges.contains(&Edge {
            from: "extract".into(),
            output: Some("rows".into()),
            to: "clean".into(),
            input: Some("rows".into()),
        }));
        assert_eq!(flow.edges.len(), 2);
    }

    #[test]
    fn test_required_input_bound_without_declaration() {
        let flows = compile_ok(
            r#"flow "t" {
                 node "a" { type: csv }
                 node "b" { type: filter }
               }"#,
        );
        assert_eq!(flows[0].node("b").unwrap().inputs["rows"].source.as_ref().unwrap().node, "a");
    }

    #[test]
    fn test_outputs_to_binding() {
        let flows = compile_ok(
            r#"flow "t" {
                 node "a" {
                   type: csv
                   outputs { rows: table to "b.rows" }
                 }
                 node "b" { type: filter }
               }"#,
        );
        let b = flows[0].node("b").unwrap();
        assert_eq!(b.inputs["rows"].source.as_ref().unwrap().node, "a");
    }

    #[test]
    fn test_policy_overrides() {
        let flows = compile_ok(
            r#"flow "t" {
                 config { retries: 1, timeout: 10, backoff: "100ms" }
                 node "slow" {
                   type: wait
                   config { retries: 4, timeout: "500ms", duration: "1s" }
                 }
                 node "plain" { type: set }
               }"#,
        );
        let flow = &flows[0];
        let slow = flow.node("slow").unwrap();
        assert_eq!(slow.policy.retries, 4);
        assert_eq!(slow.policy.timeout, Some(Duration::from_millis(500)));
        assert_eq!(slow.policy.backoff, Duration::from_millis(100));
        assert_eq!(slow.config, json!({"duration": "1s"}));

        let plain = flow.node("plain").unwrap();
        assert_eq!(plain.policy.retries, 1);
        assert_eq!(plain.policy.timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_depends_on_adds_control_edges() {
        let flows = compile_ok(
            r#"flow "t" {
                 node "a" { type: set }
                 node "b" { type: set }
                 node "c" { type: debug, depends_on: [a, "b", a] }
               }"#,
        );
        let c = flows[0].node("c").unwrap();
        assert_eq!(c.depends_on, vec!["a", "b"]);
        assert_eq!(flows[0].edges, vec![Edge::control("a", "c"), Edge::control("b", "c")]);
    }

    #[test]
    fn test_literal_conversion() {
        let flows = compile_ok(
            r#"flow "t" {
                 node "s" {
                   type: set
                   config { n: 3, f: 1.5, neg: -2, yes: true, none: null, word: hello, list: [1, "x"] }
                 }
               }"#,
        );
        assert_eq!(
            flows[0].node("s").unwrap().config,
            json!({"n": 3, "f": 1.5, "neg": -2, "yes": true, "none": null, "word": "hello", "list": [1, "x"]})
        );
    }

    #[test]
    fn test_unknown_type_omits_node() {
        let (program, _) = parse(
            r#"flow "t" {
                 node "good" { type: set }
                 node "bad" { type: teleport }
                 node "after" { type: debug, depends_on: [bad] }
               }"#,
        );
        let compilation = compile(&program, &registry());
        assert_eq!(codes(&compilation.diagnostics), vec![DiagnosticCode::UnknownType]);
        let flow = &compilation.flows[0];
        assert_eq!(flow.node_names().collect::<Vec<_>>(), vec!["good", "after"]);
        assert!(flow.edges.is_empty());

        let diagnostic = compilation.diagnostics.errors().next().unwrap();
        assert_eq!(diagnostic.position, Some(Position::new(3, 37)));
    }

    #[test]
    fn test_missing_type() {
        let diagnostics = compile_err(r#"flow "t" { node "a" { config { x: 1 } } }"#);
        assert_eq!(codes(&diagnostics), vec![DiagnosticCode::MissingType]);
    }

    #[test]
    fn test_duplicate_nodes_and_flows() {
        let diagnostics = compile_err(
            r#"flow "t" { node "a" { type: set } node "a" { type: set } }
               flow "t" { }"#,
        );
        assert_eq!(
            codes(&diagnostics),
            vec![DiagnosticCode::DuplicateNode, DiagnosticCode::DuplicateFlow]
        );
    }

    #[test]
    fn test_binding_errors() {
        let diagnostics = compile_err(
            r#"flow "t" {
                 node "a" { type: csv }
                 node "b" {
                   type: filter
                   inputs { rows: table from "ghost.rows" }
                 }
                 node "c" {
                   type: report
                   inputs { kept: table from "a.missing", title: number }
                 }
               }"#,
        );
        assert_eq!(
            codes(&diagnostics),
            vec![
                DiagnosticCode::TypeMismatch,
                DiagnosticCode::UnresolvedReference,
                DiagnosticCode::UnresolvedReference,
            ]
        );
    }

    #[test]
    fn test_unknown_port_and_type_mismatch() {
        let diagnostics = compile_err(
            r#"flow "t" {
                 node "a" {
                   type: csv
                   outputs { rows: text, cols: table }
                 }
               }"#,
        );
        assert_eq!(
            codes(&diagnostics),
            vec![DiagnosticCode::TypeMismatch, DiagnosticCode::UnknownPort]
        );
    }

    #[test]
    fn test_ambiguous_implicit_binding() {
        let diagnostics = compile_err(
            r#"flow "t" {
                 node "a" { type: csv }
                 node "b" { type: csv }
                 node "c" { type: filter }
               }"#,
        );
        assert_eq!(codes(&diagnostics), vec![DiagnosticCode::AmbiguousBinding]);
        assert!(diagnostics.errors().next().unwrap().message.contains("a, b"));
    }

    #[test]
    fn test_unbound_required_input() {
        let diagnostics = compile_err(r#"flow "t" { node "f" { type: filter } }"#);
        assert_eq!(codes(&diagnostics), vec![DiagnosticCode::UnboundInput]);
    }

    #[test]
    fn test_outputs_block_limits_visibility() {
        let diagnostics = compile_err(
            r#"flow "t" {
                 node "a" {
                   type: csv
                   outputs { }
                 }
                 node "b" { type: filter }
               }"#,
        );
        assert_eq!(codes(&diagnostics), vec![DiagnosticCode::UnboundInput]);
    }

    #[test]
    fn test_cycle_is_fatal_and_names_every_node() {
        let (program, _) = parse(
            r#"flow "loop" {
                 node "a" { type: set, depends_on: [c] }
                 node "b" { type: set, depends_on: [a] }
                 node "c" { type: set, depends_on: [b] }
               }
               flow "fine" { node "x" { type: set } }"#,
        );
        let compilation = compile(&program, &registry());
        let errors: Vec<_> = compilation.diagnostics.errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, DiagnosticCode::DependencyCycle);
        for name in ["a", "b", "c"] {
            assert!(errors[0].message.contains(&format!("{} ", name)) || errors[0].message.ends_with(name));
        }
        assert_eq!(compilation.flows.len(), 1);
        assert_eq!(compilation.flows[0].name, "fine");
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let diagnostics = compile_err(r#"flow "t" { node "a" { type: set, depends_on: [a] } }"#);
        assert_eq!(codes(&diagnostics), vec![DiagnosticCode::DependencyCycle]);
    }

    #[test]
    fn test_misplaced_statements() {
        let diagnostics = compile_err(
            r#"flow "t" {
                 owner: "ops"
                 inputs { x: any }
                 node "a" { type: set, colour: red, node "inner" { } }
               }"#,
        );
        assert_eq!(
            codes(&diagnostics),
            vec![
                DiagnosticCode::UnknownAttribute,
                DiagnosticCode::UnknownAttribute,
                DiagnosticCode::UnknownAttribute,
                DiagnosticCode::UnknownAttribute,
            ]
        );
    }

    #[test]
    fn test_syntax_errors_fail_compile_source() {
        let diagnostics = compile_err(r#"flow "t" { invalid syntax }"#);
        assert_eq!(codes(&diagnostics), vec![DiagnosticCode::UnexpectedToken]);
    }

    #[test]
    fn test_defaults_apply_to_flows() {
        let registry = registry();
        let defaults = FlowConfig {
            retries: 2,
            ..FlowConfig::default()
        };
        let compiler = Compiler::new(&registry).with_defaults(defaults);
        let flows = compile_source_with(&compiler, r#"flow "t" { node "a" { type: set } }"#).unwrap();
        assert_eq!(flows[0].config.retries, 2);
        assert_eq!(flows[0].nodes[0].policy.retries, 2);
    }
}
