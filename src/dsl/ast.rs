//! Abstract syntax tree for flow source.
//!
//! Every node owns its children outright. Source positions are not stored in
//! the tree: each node carries a [`NodeId`] and the [`Program`] keeps a
//! side-table from id to [`Position`]. Ids are handed out in parse order, so
//! two parses of structurally identical source produce equal trees.

use std::fmt;

use super::diagnostics::Position;

/// Arena identity of an AST node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Side-table of node positions, indexed by [`NodeId`].
#[derive(Debug, Clone, Default)]
pub struct PositionTable {
    entries: Vec<Position>,
}

impl PositionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id and record where the node starts.
    pub fn alloc(&mut self, position: Position) -> NodeId {
        let id = NodeId(self.entries.len() as u32);
        self.entries.push(position);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<Position> {
        self.entries.get(id.0 as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Root of a parsed source file.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub flows: Vec<Flow>,
    pub positions: PositionTable,
}

impl PartialEq for Program {
    fn eq(&self, other: &Self) -> bool {
        self.flows == other.flows
    }
}

impl Program {
    pub fn position(&self, id: NodeId) -> Option<Position> {
        self.positions.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Canonical source rendering.
    pub fn render(&self) -> String {
        let mut printer = Printer::default();
        for (i, flow) in self.flows.iter().enumerate() {
            if i > 0 {
                printer.blank();
            }
            flow.print(&mut printer);
        }
        printer.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub id: NodeId,
    pub name: StringLiteral,
    pub body: BlockStatement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockStatement {
    pub id: NodeId,
    pub statements: Vec<Statement>,
}

impl BlockStatement {
    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.statements.iter().filter_map(|s| match s {
            Statement::Assignment(a) => Some(a),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Config(Config),
    Node(FlowNode),
    Ports(Ports),
    Assignment(Assignment),
}

impl Statement {
    pub fn id(&self) -> NodeId {
        match self {
            Statement::Config(c) => c.id,
            Statement::Node(n) => n.id,
            Statement::Ports(p) => p.id,
            Statement::Assignment(a) => a.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub id: NodeId,
    pub body: BlockStatement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowNode {
    pub id: NodeId,
    pub name: StringLiteral,
    pub body: BlockStatement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Inputs,
    Outputs,
}

impl PortDirection {
    pub fn keyword(&self) -> &'static str {
        match self {
            PortDirection::Inputs => "inputs",
            PortDirection::Outputs => "outputs",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ports {
    pub id: NodeId,
    pub direction: PortDirection,
    pub ports: Vec<PortDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortDecl {
    pub id: NodeId,
    pub name: Identifier,
    pub value_type: Identifier,
    pub binding: Option<PortBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKeyword {
    From,
    To,
}

impl BindingKeyword {
    pub fn keyword(&self) -> &'static str {
        match self {
            BindingKeyword::From => "from",
            BindingKeyword::To => "to",
        }
    }
}

/// `from "node.port"` or `to "node.port"` on a port declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct PortBinding {
    pub keyword: BindingKeyword,
    pub target: StringLiteral,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub id: NodeId,
    pub key: Identifier,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(StringLiteral),
    Number(NumberLiteral),
    Identifier(Identifier),
    List(ListLiteral),
}

impl Value {
    pub fn id(&self) -> NodeId {
        match self {
            Value::String(s) => s.id,
            Value::Number(n) => n.id,
            Value::Identifier(i) => i.id,
            Value::List(l) => l.id,
        }
    }

    /// Short name of the value's kind, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Identifier(_) => "identifier",
            Value::List(_) => "list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub id: NodeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringLiteral {
    pub id: NodeId,
    pub value: String,
}

/// Numeric literal. `literal` keeps the source spelling for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberLiteral {
    pub id: NodeId,
    pub literal: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListLiteral {
    pub id: NodeId,
    pub items: Vec<Value>,
}

// ============================================================================
// Canonical rendering
// ============================================================================

const INDENT: &str = "  ";

#[derive(Default)]
struct Printer {
    out: String,
    depth: usize,
}

impl Printer {
    fn line(&mut self, text: &str) {
        for _ in 0..self.depth {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    fn open(&mut self, header: &str) {
        self.line(&format!("{} {{", header));
        self.depth += 1;
    }

    fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.line("}");
    }

    fn finish(self) -> String {
        self.out
    }

    /// Rendering of a single node, without the trailing newline.
    fn render(node: &impl Print) -> String {
        let mut printer = Printer::default();
        node.print(&mut printer);
        let mut out = printer.finish();
        if out.ends_with('\n') {
            out.pop();
        }
        out
    }
}

trait Print {
    fn print(&self, p: &mut Printer);
}

impl Print for Flow {
    fn print(&self, p: &mut Printer) {
        p.open(&format!("flow {}", self.name));
        self.body.print(p);
        p.close();
    }
}

impl Print for BlockStatement {
    fn print(&self, p: &mut Printer) {
        for statement in &self.statements {
            statement.print(p);
        }
    }
}

impl Print for Statement {
    fn print(&self, p: &mut Printer) {
        match self {
            Statement::Config(c) => c.print(p),
            Statement::Node(n) => n.print(p),
            Statement::Ports(ports) => ports.print(p),
            Statement::Assignment(a) => a.print(p),
        }
    }
}

impl Print for Config {
    fn print(&self, p: &mut Printer) {
        p.open("config");
        self.body.print(p);
        p.close();
    }
}

impl Print for FlowNode {
    fn print(&self, p: &mut Printer) {
        p.open(&format!("node {}", self.name));
        self.body.print(p);
        p.close();
    }
}

impl Print for Ports {
    fn print(&self, p: &mut Printer) {
        p.open(self.direction.keyword());
        for decl in &self.ports {
            decl.print(p);
        }
        p.close();
    }
}

impl Print for PortDecl {
    fn print(&self, p: &mut Printer) {
        p.line(&self.to_string());
    }
}

impl Print for Assignment {
    fn print(&self, p: &mut Printer) {
        p.line(&self.to_string());
    }
}

macro_rules! display_via_printer {
    ($($ty:ty),* $(,)?) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&Printer::render(self))
                }
            }
        )*
    };
}

display_via_printer!(Flow, BlockStatement, Statement, Config, FlowNode, Ports);

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl fmt::Display for PortDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value_type)?;
        if let Some(binding) = &self.binding {
            write!(f, " {} {}", binding.keyword.keyword(), binding.target)?;
        }
        Ok(())
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Number(n) => write!(f, "{}", n),
            Value::Identifier(i) => write!(f, "{}", i),
            Value::List(l) => write!(f, "{}", l),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Display for StringLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"")?;
        for c in self.value.chars() {
            match c {
                '"' => f.write_str("\\\"")?,
                '\\' => f.write_str("\\\\")?,
                '\n' => f.write_str("\\n")?,
                '\t' => f.write_str("\\t")?,
                '\r' => f.write_str("\\r")?,
                other => write!(f, "{}", other)?,
            }
        }
        f.write_str("\"")
    }
}

impl fmt::Display for NumberLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.literal)
    }
}

impl fmt::Display for ListLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", item)?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(table: &mut PositionTable, name: &str) -> Identifier {
        Identifier {
            id: table.alloc(Position::new(1, 1)),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_position_table_allocates_in_order() {
        let mut table = PositionTable::new();
        let a = table.alloc(Position::new(1, 1));
        let b = table.alloc(Position::new(2, 4));
        assert_eq!(a, NodeId(0));
        assert_eq!(b, NodeId(1));
        assert_eq!(table.get(b), Some(Position::new(2, 4)));
        assert_eq!(table.get(NodeId(9)), None);
    }

    #[test]
    fn test_string_literal_escaping() {
        let s = StringLiteral {
            id: NodeId(0),
            value: "say \"hi\"\\\n".to_string(),
        };
        assert_eq!(s.to_string(), r#""say \"hi\"\\\n""#);
    }

    #[test]
    fn test_render_nested_blocks() {
        let mut t = PositionTable::new();
        let retries = Assignment {
            id: t.alloc(Position::new(1, 1)),
            key: ident(&mut t, "retries"),
            value: Value::Number(NumberLiteral {
                id: t.alloc(Position::new(1, 1)),
                literal: "3".to_string(),
                value: 3.0,
            }),
        };
        let deps = Assignment {
            id: t.alloc(Position::new(1, 1)),
            key: ident(&mut t, "depends_on"),
            value: Value::List(ListLiteral {
                id: t.alloc(Position::new(1, 1)),
                items: vec![
                    Value::Identifier(ident(&mut t, "a")),
                    Value::String(StringLiteral {
                        id: t.alloc(Position::new(1, 1)),
                        value: "b".to_string(),
                    }),
                ],
            }),
        };
        let flow = Flow {
            id: t.alloc(Position::new(1, 1)),
            name: StringLiteral {
                id: t.alloc(Position::new(1, 1)),
                value: "t".to_string(),
            },
            body: BlockStatement {
                id: t.alloc(Position::new(1, 1)),
                statements: vec![
                    Statement::Config(Config {
                        id: t.alloc(Position::new(1, 1)),
                        body: BlockStatement {
                            id: t.alloc(Position::new(1, 1)),
                            statements: vec![Statement::Assignment(retries)],
                        },
                    }),
                    Statement::Assignment(deps),
                ],
            },
        };
        let program = Program {
            flows: vec![flow],
            positions: t,
        };

        assert_eq!(
            program.render(),
            "flow \"t\" {\n  config {\n    retries: 3\n  }\n  depends_on: [a, \"b\"]\n}\n"
        );
    }

    #[test]
    fn test_program_equality_ignores_positions() {
        let mut a = Program::default();
        a.positions.alloc(Position::new(1, 1));
        let b = Program::default();
        assert_eq!(a, b);
    }
}
