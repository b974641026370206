//! bodies of generated artifacts
use super::output::encode_name;
use crate::descriptor::DataBlock;
use crate::traversal::{TraversalRef, DATA_ROOT};
use crate::value::Value;
use hcl::{Block, Body, Expression};
use indexmap::IndexMap;

pub const REMOTE_STATE: &str = "terraform_remote_state";

/// `output "<encoded key>" { value = <expr> }`
pub fn output_block(reference: &TraversalRef, value: Expression) -> Block {
    Block::builder("output")
        .add_label(encode_name(&reference.key()))
        .add_attribute(("value", value))
        .build()
}

/// Remote state lookup of a dependency plus one output per reference into it
///
/// `dependency.<name>.outputs.x` reads `data.terraform_remote_state.<name>.outputs.x`.
pub fn remote_state(
    name: &str,
    backend_type: &str,
    config: Value,
    references: &[TraversalRef],
) -> Body {
    let lookup = Block::builder("data")
        .add_label(REMOTE_STATE)
        .add_label(name)
        .add_attribute(("backend", backend_type))
        .add_attribute(("config", Expression::from(config)))
        .build();

    references
        .iter()
        .fold(Body::builder().add_block(lookup), |body, reference| {
            let rebased = reference.rebase(2, &[DATA_ROOT, REMOTE_STATE, name]);
            body.add_block(output_block(reference, rebased.to_expression()))
        })
        .build()
}

/// Compatibility shim, the data blocks as written and one output per reference
pub fn data_sources(shim: Body, data: &[DataBlock], references: &[TraversalRef]) -> Body {
    let mut body = shim.into_iter().fold(Body::builder(), |body, structure| {
        body.add_structure(structure)
    });

    for block in data {
        body = body.add_block(Block {
            identifier: hcl::Identifier::unchecked("data"),
            labels: vec![
                hcl::BlockLabel::from(block.data_type.as_str()),
                hcl::BlockLabel::from(block.name.as_str()),
            ],
            body: block.body.clone(),
        });
    }

    for reference in references {
        body = body.add_block(output_block(reference, reference.to_expression()));
    }

    body.build()
}

/// `terraform { backend "<type>" { ... } }`
pub fn backend_override(backend_type: &str, attributes: IndexMap<String, Value>) -> Body {
    let backend = attributes
        .into_iter()
        .fold(
            Block::builder("backend").add_label(backend_type),
            |block, (key, value)| {
                block.add_attribute(hcl::Attribute::new(
                    hcl::Identifier::unchecked(key),
                    Expression::from(value),
                ))
            },
        )
        .build();

    Body::builder()
        .add_block(Block::builder("terraform").add_block(backend).build())
        .build()
}

/// One attribute per input
pub fn variables(values: IndexMap<String, Value>) -> Body {
    values
        .into_iter()
        .fold(Body::builder(), |body, (name, value)| {
            body.add_attribute(hcl::Attribute::new(
                hcl::Identifier::unchecked(name),
                Expression::from(value),
            ))
        })
        .build()
}
