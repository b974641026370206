//! block level merge of partial descriptors
//!
//! | block                                          | key         | strategy                                   |
//! |------------------------------------------------|-------------|--------------------------------------------|
//! | `module`, `backend`, `inputs`, `environment_variables` | -   | union of attributes, later wins            |
//! | `data`                                         | type + name | append new, merge bodies of existing       |
//! | `dependency`                                   | name        | append new, later wins, backends merge     |
//! | `hook`                                         | type        | append new, first non-null wins, args concatenate |
//!
//! Object valued attributes (`tags = { ... }`) merge key by key instead of being replaced.
use super::{Attributes, Backend, DataBlock, Dependency, Descriptor, Hook, Module};
use hcl::{Expression, ObjectKey, Structure};
use indexmap::IndexMap;
use std::path::PathBuf;

impl Descriptor {
    /// Merge partial descriptors in order (auto imports first, primary file last)
    ///
    /// The result takes the path of the last partial.
    pub fn merge<I>(partials: I) -> Result<Descriptor, MergeError>
    where
        I: IntoIterator<Item = Descriptor>,
    {
        let mut partials = partials.into_iter();
        let Some(mut merged) = partials.next() else {
            return Ok(Descriptor::default());
        };

        for partial in partials {
            merged.merge_from(partial)?;
        }

        Ok(merged)
    }

    /// Merge `other` on top of `self`
    pub fn merge_from(&mut self, other: Descriptor) -> Result<(), MergeError> {
        tracing::debug!(base=%self.path.display(), other=%other.path.display(), "merging descriptors");

        let path = other.path.clone();

        merge_option(&mut self.module, other.module, |module, other| {
            module.merge(other);
            Ok(())
        })?;
        merge_option(&mut self.backend, other.backend, |backend, other| {
            backend.merge(other, &path)
        })?;

        for data in other.data {
            match self
                .data
                .iter_mut()
                .find(|existing| existing.key() == data.key())
            {
                Some(existing) => existing.merge(data),
                None => self.data.push(data),
            }
        }

        for dependency in other.dependencies {
            match self
                .dependencies
                .iter_mut()
                .find(|existing| existing.name == dependency.name)
            {
                Some(existing) => existing.merge(dependency, &path)?,
                None => self.dependencies.push(dependency),
            }
        }

        for hook in other.hooks {
            match self
                .hooks
                .iter_mut()
                .find(|existing| existing.hook_type == hook.hook_type)
            {
                Some(existing) => existing.merge(hook),
                None => self.hooks.push(hook),
            }
        }

        merge_optional_attributes(&mut self.environment_variables, other.environment_variables);
        merge_optional_attributes(&mut self.inputs, other.inputs);

        self.path = path;
        Ok(())
    }
}

impl Module {
    fn merge(&mut self, other: Module) {
        if other.source.is_some() {
            self.source = other.source;
        }
        if other.version.is_some() {
            self.version = other.version;
        }
    }
}

impl Backend {
    pub(crate) fn merge(&mut self, other: Backend, path: &std::path::Path) -> Result<(), MergeError> {
        if self.backend_type != other.backend_type {
            return Err(MergeError::DifferentBackendTypes {
                path: path.to_path_buf(),
                existing: self.backend_type.clone(),
                new: other.backend_type,
            });
        }

        merge_attributes(&mut self.attributes, other.attributes);
        Ok(())
    }
}

impl DataBlock {
    fn merge(&mut self, other: DataBlock) {
        let body = std::mem::take(&mut self.body);
        self.body = merge_bodies(body, other.body);
    }
}

impl Dependency {
    fn merge(&mut self, other: Dependency, path: &std::path::Path) -> Result<(), MergeError> {
        if other.source.is_some() {
            self.source = other.source;
        }
        if other.separate_environment.is_some() {
            self.separate_environment = other.separate_environment;
        }

        merge_option(&mut self.backend, other.backend, |backend, other| {
            backend.merge(other, path)
        })
    }
}

impl Hook {
    fn merge(&mut self, other: Hook) {
        self.trigger = self.trigger.take().or(other.trigger);
        self.command = self.command.take().or(other.command);
        self.script = self.script.take().or(other.script);
        self.set_env = self.set_env.or(other.set_env);
        self.fail_on_error = self.fail_on_error.or(other.fail_on_error);
        self.disable_cache = self.disable_cache.or(other.disable_cache);
        self.args.extend(other.args);
    }
}

/// Merge two optional blocks, a missing side takes the other as is
fn merge_option<T>(
    base: &mut Option<T>,
    other: Option<T>,
    merge: impl FnOnce(&mut T, T) -> Result<(), MergeError>,
) -> Result<(), MergeError> {
    let Some(other) = other else {
        return Ok(());
    };

    match base {
        Some(base) => merge(base, other),
        None => {
            *base = Some(other);
            Ok(())
        }
    }
}

fn merge_optional_attributes(base: &mut Option<Attributes>, other: Option<Attributes>) {
    if let Some(other) = other {
        merge_attributes(base.get_or_insert_with(Attributes::new), other);
    }
}

/// Union of attributes, later wins
pub(crate) fn merge_attributes(base: &mut Attributes, other: Attributes) {
    for (key, expr) in other {
        match base.get_mut(&key) {
            Some(existing) => merge_expression(existing, expr),
            None => {
                base.insert(key, expr);
            }
        }
    }
}

/// Objects merge key by key, everything else is replaced
fn merge_expression(base: &mut Expression, other: Expression) {
    match (base, other) {
        (Expression::Object(base), Expression::Object(other)) => {
            let mut entries: Vec<(ObjectKey, Expression)> =
                std::mem::take(base).into_iter().collect();

            for (key, value) in other {
                let name = object_key_name(&key);
                let existing = name.as_ref().and_then(|name| {
                    entries
                        .iter_mut()
                        .find(|(existing, _)| object_key_name(existing).as_ref() == Some(name))
                });

                match existing {
                    Some((_, existing)) => merge_expression(existing, value),
                    None => entries.push((key, value)),
                }
            }

            *base = entries.into_iter().collect();
        }
        (base, other) => *base = other,
    }
}

/// Literal name of an object key, if it has one
fn object_key_name(key: &ObjectKey) -> Option<String> {
    match key {
        ObjectKey::Identifier(ident) => Some(ident.to_string()),
        ObjectKey::Expression(Expression::String(s)) => Some(s.clone()),
        ObjectKey::Expression(Expression::Variable(var)) => Some(var.as_str().to_string()),
        _ => None,
    }
}

/// Merge two free-form bodies
///
/// Attributes follow [merge_attributes], nested blocks are appended.
fn merge_bodies(base: hcl::Body, other: hcl::Body) -> hcl::Body {
    let mut attributes: IndexMap<String, Expression> = IndexMap::new();
    let mut blocks = vec![];

    for structure in base.into_iter().chain(other) {
        match structure {
            Structure::Attribute(attribute) => {
                let key = attribute.key.to_string();
                match attributes.get_mut(&key) {
                    Some(existing) => merge_expression(existing, attribute.expr),
                    None => {
                        attributes.insert(key, attribute.expr);
                    }
                }
            }
            Structure::Block(block) => blocks.push(block),
        }
    }

    let builder = attributes
        .into_iter()
        .fold(hcl::Body::builder(), |builder, (key, expr)| {
            builder.add_attribute(hcl::Attribute::new(hcl::Identifier::unchecked(key), expr))
        });

    blocks
        .into_iter()
        .fold(builder, |builder, block| builder.add_block(block))
        .build()
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum MergeError {
    #[error("{}: backend type `{new}` differs from previously defined `{existing}`", .path.display())]
    DifferentBackendTypes {
        path: PathBuf,
        existing: String,
        new: String,
    },
}
