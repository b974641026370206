//! references from `inputs` to other units and data sources
//!
//! Only the syntax of expressions is inspected, nothing gets evaluated. A reference is the
//! leading run of attribute accesses of a traversal:
//!
//! | expression                                   | reference                       |
//! |----------------------------------------------|---------------------------------|
//! | `dependency.vpc.outputs.id`                  | `dependency.vpc.outputs.id`     |
//! | `dependency.vpc.outputs.subnets[0]`          | `dependency.vpc.outputs.subnets`|
//! | `data.azurerm_client_config.current.tenant_id` | `data.azurerm_client_config.current.tenant_id` |
//! | `"${dependency.vpc.outputs.name}-suffix"`    | `dependency.vpc.outputs.name`   |
//!
//! References to anything else (`local.x`, `var.y`) are ignored.
use crate::descriptor::Attributes;
use crate::visit::VisitTraversals;
use hcl::{Expression, Traversal, TraversalOperator};
use std::collections::BTreeSet;

pub const DEPENDENCY_ROOT: &str = "dependency";
pub const DATA_ROOT: &str = "data";

/// A dotted path into the values of a dependency or data source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraversalRef {
    segments: Vec<String>,
}

/// What a reference points into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root<'a> {
    Dependency { name: &'a str },
    Data { data_type: &'a str, name: &'a str },
}

impl TraversalRef {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Leading variable and attribute accesses of a traversal
    pub fn from_traversal(traversal: &Traversal) -> Option<Self> {
        let Expression::Variable(var) = &traversal.expr else {
            return None;
        };

        let mut segments = vec![var.as_str().to_string()];
        for operator in &traversal.operators {
            let TraversalOperator::GetAttr(ident) = operator else {
                break;
            };
            segments.push(ident.as_str().to_string());
        }

        Some(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Dot separated form, the key in a [crate::tree::ValueTree]
    pub fn key(&self) -> String {
        self.segments.join(".")
    }

    /// Classify by the first segments, `None` for references not resolved by generation
    pub fn root(&self) -> Option<Root<'_>> {
        match self.segments.as_slice() {
            [root, name, ..] if root == DEPENDENCY_ROOT => Some(Root::Dependency { name }),
            [root, data_type, name, ..] if root == DATA_ROOT => Some(Root::Data { data_type, name }),
            _ => None,
        }
    }

    pub fn is_prefix_of(&self, other: &TraversalRef) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// Replace the first `strip` segments with `base`
    ///
    /// `dependency.vpc.outputs.id` rebased with `(2, ["data", "terraform_remote_state", "vpc"])`
    /// is `data.terraform_remote_state.vpc.outputs.id`.
    pub fn rebase(&self, strip: usize, base: &[&str]) -> TraversalRef {
        let rest = self.segments.iter().skip(strip).cloned();
        Self {
            segments: base.iter().map(|s| s.to_string()).chain(rest).collect(),
        }
    }

    /// Build the traversal expression for this reference
    pub fn to_expression(&self) -> Expression {
        let mut segments = self.segments.iter();
        let Some(root) = segments.next() else {
            return Expression::Null;
        };

        let builder = segments.fold(
            Traversal::builder(hcl::Variable::unchecked(root.as_str())),
            |builder, segment| builder.attr(hcl::Identifier::unchecked(segment.as_str())),
        );
        builder.build().into()
    }
}

impl std::fmt::Display for TraversalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// All dependency and data references of `attributes`
///
/// The result is sorted and free of duplicates. A reference that extends another one
/// (`dependency.a.outputs.x` and `dependency.a.outputs`) is dropped in favour of the shorter one.
pub fn extract_traversals(attributes: &Attributes) -> Vec<TraversalRef> {
    let mut found = BTreeSet::new();
    let mut collect = |traversal: &Traversal| {
        if let Some(reference) = TraversalRef::from_traversal(traversal) {
            if reference.root().is_some() {
                tracing::trace!(%reference, "found reference");
                found.insert(reference);
            }
        }
    };

    for expr in attributes.values() {
        expr.visit_traversals(&mut collect);
    }

    collapse(found)
}

fn collapse(sorted: BTreeSet<TraversalRef>) -> Vec<TraversalRef> {
    let mut kept: Vec<TraversalRef> = vec![];
    for reference in sorted {
        // prefixes sort before their extensions
        if kept.last().is_some_and(|last| last.is_prefix_of(&reference)) {
            continue;
        }
        kept.push(reference);
    }
    kept
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptor;
    use pretty_assertions::assert_eq;

    fn extract(inputs: &str) -> Vec<String> {
        let descriptor = descriptor!(&format!("inputs {{\n{inputs}\n}}"));
        extract_traversals(&descriptor.inputs.unwrap_or_default())
            .iter()
            .map(TraversalRef::key)
            .collect()
    }

    #[test]
    fn finds_references_everywhere() {
        assert_eq!(
            extract(
                r#"
                plain    = dependency.vpc.outputs.id
                indexed  = dependency.vpc.outputs.subnets[0]
                template = "${dependency.dns.outputs.zone}-suffix"
                call     = upper(data.azurerm_client_config.current.tenant_id)
                cond     = var.enabled ? dependency.db.outputs.host : "none"
                object   = { key = dependency.kv.outputs.uri }
                list     = [for s in dependency.net.outputs.names : upper(s)]
                ignored  = local.something.other
                short    = data.only_type
                "#
            ),
            vec![
                "data.azurerm_client_config.current.tenant_id",
                "dependency.db.outputs.host",
                "dependency.dns.outputs.zone",
                "dependency.kv.outputs.uri",
                "dependency.net.outputs.names",
                "dependency.vpc.outputs.id",
                "dependency.vpc.outputs.subnets",
            ]
        );
    }

    #[test]
    fn extensions_collapse_into_prefix() {
        assert_eq!(
            extract(
                r#"
                whole = dependency.vpc.outputs
                part  = dependency.vpc.outputs.id
                other = dependency.vpcx.outputs.id
                "#
            ),
            vec!["dependency.vpc.outputs", "dependency.vpcx.outputs.id"]
        );
    }

    #[test]
    fn classifies_roots() {
        let dependency = TraversalRef::new(["dependency", "vpc", "outputs", "id"]);
        assert_eq!(dependency.root(), Some(Root::Dependency { name: "vpc" }));

        let data = TraversalRef::new(["data", "azurerm_subscription", "current", "id"]);
        assert_eq!(
            data.root(),
            Some(Root::Data {
                data_type: "azurerm_subscription",
                name: "current"
            })
        );

        assert_eq!(TraversalRef::new(["data", "x"]).root(), None);
        assert_eq!(TraversalRef::new(["dependency"]).root(), None);
    }

    #[test]
    fn rebase_and_render() {
        let reference = TraversalRef::new(["dependency", "vpc", "outputs", "id"]);
        let rebased = reference.rebase(2, &["data", "terraform_remote_state", "vpc"]);

        assert_eq!(rebased.key(), "data.terraform_remote_state.vpc.outputs.id");

        let expected: Expression = Traversal::builder(hcl::Variable::unchecked("data"))
            .attr("terraform_remote_state")
            .attr("vpc")
            .attr("outputs")
            .attr("id")
            .build()
            .into();
        assert_eq!(rebased.to_expression(), expected);
    }
}
