use crate::modules::ModuleRegistry;
use hashbrown::HashMap;
use osmium::packet::Value;
use osmium::policy::node::{
    AttrUpdate, CondOp, Condition, ListTarget, Node, NodeKind, Template, UpdateOp,
};
use osmium::policy::PolicySet;
use serde_derive::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Declarative form of a policy tree, deserialized from the configuration. The surface
/// syntax of the policy language is out of scope; this structure is the compiler's input.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PolicyDef {
    Group {
        #[serde(default)]
        children: Vec<PolicyDef>,
    },
    Module {
        name: String,
    },
    If {
        cond: CondDef,
        #[serde(default)]
        children: Vec<PolicyDef>,
    },
    Elsif {
        cond: CondDef,
        #[serde(default)]
        children: Vec<PolicyDef>,
    },
    Else {
        #[serde(default)]
        children: Vec<PolicyDef>,
    },
    Update {
        updates: Vec<UpdateDef>,
    },
    Switch {
        attr: u8,
        cases: Vec<CaseDef>,
    },
    Foreach {
        attr: u8,
        #[serde(default)]
        children: Vec<PolicyDef>,
    },
    Break,
    Return,
    LoadBalance {
        #[serde(default)]
        children: Vec<PolicyDef>,
    },
    RedundantLoadBalance {
        #[serde(default)]
        children: Vec<PolicyDef>,
    },
    Parallel {
        #[serde(default)]
        children: Vec<PolicyDef>,
    },
    Policy {
        name: String,
    },
    Xlat {
        template: TemplateDef,
    },
}

#[derive(Deserialize, Debug, Clone)]
pub struct CondDef {
    pub attr: u8,
    #[serde(default)]
    pub equals: Option<String>,
    #[serde(default)]
    pub negate: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UpdateDef {
    pub list: String,
    pub attr: u8,
    pub op: String,
    #[serde(default)]
    pub value: Option<TemplateDef>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CaseDef {
    #[serde(default)]
    pub matches: Option<String>,
    #[serde(default)]
    pub children: Vec<PolicyDef>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum TemplateDef {
    Literal(String),
    Attr { attr: u8 },
}

/// The per-code-class policy roots plus the named reusable policies they may reference.
#[derive(Deserialize, Debug, Clone)]
pub struct PolicyConfig {
    pub auth: PolicyDef,
    #[serde(default)]
    pub acct: Option<PolicyDef>,
    #[serde(default)]
    pub status: Option<PolicyDef>,
    #[serde(default)]
    pub policies: HashMap<String, PolicyDef>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum CompileError {
    UnknownModule(String),
    UnknownPolicy(String),
    RecursivePolicy(String),
    BreakOutsideForeach,
    MisplacedBranch,
    BadUpdate(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompileError::UnknownModule(name) => write!(f, "unknown module '{}'", name),
            CompileError::UnknownPolicy(name) => write!(f, "unknown policy '{}'", name),
            CompileError::RecursivePolicy(name) => write!(f, "policy '{}' references itself", name),
            CompileError::BreakOutsideForeach => write!(f, "break outside of a foreach"),
            CompileError::MisplacedBranch => write!(f, "elsif/else must follow if or elsif"),
            CompileError::BadUpdate(what) => write!(f, "bad update entry: {}", what),
        }
    }
}

struct Compiler<'a> {
    registry: &'a ModuleRegistry,
    named: &'a HashMap<String, PolicyDef>,
    foreach_depth: usize,
    resolving: Vec<String>,
}

/// Compiles a declarative definition into an executable node tree.
pub fn compile_policy(
    def: &PolicyDef,
    registry: &ModuleRegistry,
    named: &HashMap<String, PolicyDef>,
) -> Result<Arc<Node>, CompileError> {
    let mut compiler = Compiler {
        registry,
        named,
        foreach_depth: 0,
        resolving: Vec::new(),
    };

    compiler.compile(def)
}

/// Compiles the full policy configuration into the engine's dispatch set. Missing acct and
/// status sections default to an empty accept.
pub fn compile_set(config: &PolicyConfig, registry: &ModuleRegistry) -> Result<PolicySet, CompileError> {
    let empty = PolicyDef::Group { children: Vec::new() };

    let auth = compile_policy(&config.auth, registry, &config.policies)?;
    let acct = compile_policy(config.acct.as_ref().unwrap_or(&empty), registry, &config.policies)?;
    let status = compile_policy(config.status.as_ref().unwrap_or(&empty), registry, &config.policies)?;

    Ok(PolicySet { auth, acct, status })
}

impl<'a> Compiler<'a> {
    fn compile(&mut self, def: &PolicyDef) -> Result<Arc<Node>, CompileError> {
        match def {
            PolicyDef::Group { children } => {
                Ok(Node::new("group", NodeKind::Group(self.compile_children(children)?)))
            }

            PolicyDef::Module { name } => {
                let module = self
                    .registry
                    .get(name)
                    .ok_or_else(|| CompileError::UnknownModule(name.clone()))?;
                Ok(Node::new(name.clone(), NodeKind::ModuleCall(module)))
            }

            PolicyDef::If { cond, children } => Ok(Node::new(
                "if",
                NodeKind::If {
                    cond: self.compile_cond(cond),
                    children: self.compile_children(children)?,
                },
            )),

            PolicyDef::Elsif { cond, children } => Ok(Node::new(
                "elsif",
                NodeKind::Elsif {
                    cond: self.compile_cond(cond),
                    children: self.compile_children(children)?,
                },
            )),

            PolicyDef::Else { children } => {
                Ok(Node::new("else", NodeKind::Else(self.compile_children(children)?)))
            }

            PolicyDef::Update { updates } => {
                let updates = updates
                    .iter()
                    .map(|update| self.compile_update(update))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Node::new("update", NodeKind::Update(updates)))
            }

            PolicyDef::Switch { attr, cases } => {
                let cases = cases
                    .iter()
                    .map(|case| {
                        Ok(Node::new(
                            "case",
                            NodeKind::Case {
                                matches: case.matches.clone().map(Value::Text),
                                children: self.compile_children(&case.children)?,
                            },
                        ))
                    })
                    .collect::<Result<Vec<_>, CompileError>>()?;

                Ok(Node::new(
                    "switch",
                    NodeKind::Switch {
                        tmpl: Template::Attr(*attr),
                        cases,
                    },
                ))
            }

            PolicyDef::Foreach { attr, children } => {
                self.foreach_depth += 1;
                let children = self.compile_children(children);
                self.foreach_depth -= 1;

                Ok(Node::new(
                    "foreach",
                    NodeKind::Foreach {
                        attr: *attr,
                        children: children?,
                    },
                ))
            }

            PolicyDef::Break => {
                if self.foreach_depth == 0 {
                    return Err(CompileError::BreakOutsideForeach);
                }
                Ok(Node::new("break", NodeKind::Break))
            }

            PolicyDef::Return => Ok(Node::new("return", NodeKind::Return)),

            PolicyDef::LoadBalance { children } => Ok(Node::new(
                "load-balance",
                NodeKind::LoadBalance(self.compile_children(children)?),
            )),

            PolicyDef::RedundantLoadBalance { children } => Ok(Node::new(
                "redundant-load-balance",
                NodeKind::RedundantLoadBalance(self.compile_children(children)?),
            )),

            PolicyDef::Parallel { children } => Ok(Node::new(
                "parallel",
                NodeKind::Parallel(self.compile_children(children)?),
            )),

            PolicyDef::Policy { name } => {
                if self.resolving.iter().any(|seen| seen == name) {
                    return Err(CompileError::RecursivePolicy(name.clone()));
                }

                let def = self
                    .named
                    .get(name)
                    .ok_or_else(|| CompileError::UnknownPolicy(name.clone()))?
                    .clone();

                self.resolving.push(name.clone());
                let child = self.compile(&def);
                self.resolving.pop();

                Ok(Node::new(name.clone(), NodeKind::Policy(child?)))
            }

            PolicyDef::Xlat { template } => Ok(Node::new(
                "xlat",
                NodeKind::Xlat(self.compile_template(template)),
            )),
        }
    }

    /// Compiles a sibling list, checking that elsif/else directly follow a conditional.
    fn compile_children(&mut self, defs: &[PolicyDef]) -> Result<Vec<Arc<Node>>, CompileError> {
        let mut children = Vec::with_capacity(defs.len());
        let mut prev_was_cond = false;

        for def in defs {
            match def {
                PolicyDef::Elsif { .. } | PolicyDef::Else { .. } => {
                    if !prev_was_cond {
                        return Err(CompileError::MisplacedBranch);
                    }
                }
                _ => {}
            }

            prev_was_cond = match def {
                PolicyDef::If { .. } | PolicyDef::Elsif { .. } => true,
                _ => false,
            };

            children.push(self.compile(def)?);
        }

        Ok(children)
    }

    fn compile_cond(&self, def: &CondDef) -> Condition {
        match &def.equals {
            Some(literal) => Condition {
                lhs: Template::Attr(def.attr),
                op: if def.negate { CondOp::Ne } else { CondOp::Eq },
                rhs: Some(Template::Literal(literal.clone())),
            },
            None => Condition {
                lhs: Template::Attr(def.attr),
                op: CondOp::Exists,
                rhs: None,
            },
        }
    }

    fn compile_template(&self, def: &TemplateDef) -> Template {
        match def {
            TemplateDef::Literal(literal) => Template::Literal(literal.clone()),
            TemplateDef::Attr { attr } => Template::Attr(*attr),
        }
    }

    fn compile_update(&self, def: &UpdateDef) -> Result<AttrUpdate, CompileError> {
        let list = match def.list.as_str() {
            "request" => ListTarget::Request,
            "reply" => ListTarget::Reply,
            other => return Err(CompileError::BadUpdate(format!("unknown list '{}'", other))),
        };

        let op = match def.op.as_str() {
            "set" => UpdateOp::Set,
            "add" => UpdateOp::Add,
            "remove" => UpdateOp::Remove,
            other => return Err(CompileError::BadUpdate(format!("unknown op '{}'", other))),
        };

        if op != UpdateOp::Remove && def.value.is_none() {
            return Err(CompileError::BadUpdate("set/add require a value".to_string()));
        }

        Ok(AttrUpdate {
            list,
            attr: def.attr,
            op,
            value: def.value.as_ref().map(|value| self.compile_template(value)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::Always;
    use osmium::policy::Rcode;

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry.register("accept", Arc::new(Always::new(Rcode::Ok)));
        registry
    }

    #[test]
    fn test_compile_from_toml() {
        let config: PolicyConfig = serdeconv::from_toml_str(
            r#"
[auth]
kind = "group"

[[auth.children]]
kind = "if"
cond = { attr = 1, equals = "alice" }

[[auth.children.children]]
kind = "update"
updates = [{ list = "reply", attr = 18, op = "set", value = "ok" }]

[[auth.children]]
kind = "else"

[[auth.children.children]]
kind = "module"
name = "accept"
"#,
        )
        .unwrap();

        let set = compile_set(&config, &registry()).unwrap();
        assert!(matches!(set.auth.kind, NodeKind::Group(_)));
    }

    #[test]
    fn test_unknown_module_rejected() {
        let def = PolicyDef::Module {
            name: "missing".to_string(),
        };

        let err = compile_policy(&def, &registry(), &HashMap::new()).unwrap_err();
        assert_eq!(err, CompileError::UnknownModule("missing".to_string()));
    }

    #[test]
    fn test_break_outside_foreach_rejected() {
        let def = PolicyDef::Group {
            children: vec![PolicyDef::Break],
        };

        let err = compile_policy(&def, &registry(), &HashMap::new()).unwrap_err();
        assert_eq!(err, CompileError::BreakOutsideForeach);
    }

    #[test]
    fn test_break_inside_foreach_allowed() {
        let def = PolicyDef::Foreach {
            attr: 25,
            children: vec![PolicyDef::Break],
        };

        assert!(compile_policy(&def, &registry(), &HashMap::new()).is_ok());
    }

    #[test]
    fn test_misplaced_else_rejected() {
        let def = PolicyDef::Group {
            children: vec![PolicyDef::Else { children: Vec::new() }],
        };

        let err = compile_policy(&def, &registry(), &HashMap::new()).unwrap_err();
        assert_eq!(err, CompileError::MisplacedBranch);
    }

    #[test]
    fn test_named_policy_resolution() {
        let mut named = HashMap::new();
        named.insert(
            "common".to_string(),
            PolicyDef::Module {
                name: "accept".to_string(),
            },
        );

        let def = PolicyDef::Group {
            children: vec![PolicyDef::Policy {
                name: "common".to_string(),
            }],
        };

        assert!(compile_policy(&def, &registry(), &named).is_ok());

        let missing = PolicyDef::Policy {
            name: "absent".to_string(),
        };
        let err = compile_policy(&missing, &registry(), &named).unwrap_err();
        assert_eq!(err, CompileError::UnknownPolicy("absent".to_string()));
    }
}
