//! deployment descriptors
//!
//! A descriptor is one parsed configuration file. Several partial descriptors (auto imports and
//! the primary file) are combined with [Descriptor::merge] and checked with [Descriptor::validate].
//!
//! ```hcl
//! module {
//!   source = "../modules/network"
//! }
//!
//! backend "azurerm" {
//!   key = "${source.name}.tfstate"
//! }
//!
//! dependency "core" {
//!   source = "../core"
//! }
//!
//! inputs {
//!   resource_group = dependency.core.outputs.resource_group_name
//! }
//! ```
//!
//! Structural fields (module source, dependency source, hook settings) are evaluated while parsing.
//! Everything that may reference other units (`inputs`, backend and data attributes) is kept as
//! an unevaluated [hcl::Expression].
mod merge;
mod validate;

pub use merge::MergeError;
pub use validate::ValidationError;

use crate::context::{self, FileContext};
use crate::util;
use hcl::{Block, Expression, Structure};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Attribute name to unevaluated expression
pub type Attributes = IndexMap<String, Expression>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Descriptor {
    /// Absolute path of the (primary) file
    pub path: PathBuf,
    pub module: Option<Module>,
    pub backend: Option<Backend>,
    pub data: Vec<DataBlock>,
    pub dependencies: Vec<Dependency>,
    pub hooks: Vec<Hook>,
    pub environment_variables: Option<Attributes>,
    pub inputs: Option<Attributes>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub source: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    pub backend_type: String,
    pub attributes: Attributes,
}

/// A provisioner data source, re-emitted verbatim
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock {
    pub data_type: String,
    pub name: String,
    pub body: hcl::Body,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub name: String,
    pub source: Option<String>,
    /// Merged over the backend of the dependency
    pub backend: Option<Backend>,
    /// Run the dependency's lookups with its own environment only
    pub separate_environment: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hook {
    pub hook_type: String,
    pub trigger: Option<String>,
    pub command: Option<String>,
    pub script: Option<String>,
    pub args: Vec<String>,
    pub set_env: Option<bool>,
    pub fail_on_error: Option<bool>,
    pub disable_cache: Option<bool>,
}

impl Descriptor {
    /// Read, parse and post-process a descriptor file
    pub fn load(path: &Path) -> Result<Self, ParseError> {
        let path = path.canonicalize().map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path=%path.display(), "loading descriptor");

        let content = std::fs::read_to_string(&path).map_err(|source| ParseError::Io {
            path: path.clone(),
            source,
        })?;

        let mut descriptor = Self::parse(&content, &FileContext::new(path))?;
        descriptor.post_process();
        Ok(descriptor)
    }

    pub fn parse(content: &str, file: &FileContext) -> Result<Self, ParseError> {
        let body: hcl::Body = hcl_edit::parser::parse_body(content)
            .map_err(|source| ParseError::Syntax {
                path: file.path().to_path_buf(),
                source,
            })?
            .into();

        let parser = BlockParser {
            file,
            ctx: file.eval_context(),
        };

        let mut descriptor = Descriptor {
            path: file.path().to_path_buf(),
            ..Default::default()
        };

        for structure in body {
            match structure {
                Structure::Attribute(attribute) => {
                    return Err(parser.error(Issue::RootAttribute(attribute.key.to_string())))
                }
                Structure::Block(block) => descriptor.add_block(block, &parser)?,
            }
        }

        tracing::trace!(path=%descriptor.path.display(), ?descriptor, "parsed descriptor");
        Ok(descriptor)
    }

    fn add_block(&mut self, block: Block, parser: &BlockParser) -> Result<(), ParseError> {
        let ident = block.identifier.to_string();
        match ident.as_str() {
            "module" => {
                parser.labels(&block, 0)?;
                if self.module.is_some() {
                    return Err(parser.error(Issue::DuplicateBlock(ident)));
                }
                self.module = Some(parser.module(block)?);
            }
            "backend" => {
                if self.backend.is_some() {
                    return Err(parser.error(Issue::DuplicateBlock(ident)));
                }
                self.backend = Some(parser.backend(block)?);
            }
            "data" => {
                let data = parser.data(block)?;
                if self
                    .data
                    .iter()
                    .any(|existing| existing.key() == data.key())
                {
                    return Err(parser.error(Issue::DuplicateBlock(format!(
                        "data \"{}\" \"{}\"",
                        data.data_type, data.name
                    ))));
                }
                self.data.push(data);
            }
            "dependency" => {
                let dependency = parser.dependency(block)?;
                if self.dependency(&dependency.name).is_some() {
                    return Err(parser.error(Issue::DuplicateBlock(format!(
                        "dependency \"{}\"",
                        dependency.name
                    ))));
                }
                self.dependencies.push(dependency);
            }
            "hook" => {
                let hook = parser.hook(block)?;
                if self
                    .hooks
                    .iter()
                    .any(|existing| existing.hook_type == hook.hook_type)
                {
                    return Err(parser.error(Issue::DuplicateBlock(format!(
                        "hook \"{}\"",
                        hook.hook_type
                    ))));
                }
                self.hooks.push(hook);
            }
            "environment_variables" => {
                parser.labels(&block, 0)?;
                if self.environment_variables.is_some() {
                    return Err(parser.error(Issue::DuplicateBlock(ident)));
                }
                self.environment_variables = Some(parser.attributes(block)?);
            }
            "inputs" => {
                parser.labels(&block, 0)?;
                if self.inputs.is_some() {
                    return Err(parser.error(Issue::DuplicateBlock(ident)));
                }
                self.inputs = Some(parser.attributes(block)?);
            }
            _ => return Err(parser.error(Issue::UnknownBlock(ident))),
        }

        Ok(())
    }

    /// Resolve hook commands and scripts written as relative paths (`./lint.sh`)
    /// against the directory of this descriptor
    pub fn post_process(&mut self) {
        let directory = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        for hook in &mut self.hooks {
            for program in [&mut hook.command, &mut hook.script].into_iter().flatten() {
                if program.starts_with('.') {
                    let absolute = util::normalize_path(&directory.join(program.as_str()));
                    tracing::trace!(hook=%hook.hook_type, from=%program, to=%absolute.display(), "resolved relative hook path");
                    *program = absolute.display().to_string();
                }
            }
        }
    }

    pub fn dependency(&self, name: &str) -> Option<&Dependency> {
        self.dependencies
            .iter()
            .find(|dependency| dependency.name == name)
    }

    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("/"))
    }
}

impl DataBlock {
    /// Identity of a data block: type and name
    pub fn key(&self) -> (&str, &str) {
        (&self.data_type, &self.name)
    }
}

/// Turns blocks into descriptor parts
struct BlockParser<'a> {
    file: &'a FileContext,
    ctx: hcl::eval::Context<'static>,
}

impl<'a> BlockParser<'a> {
    fn error(&self, issue: Issue) -> ParseError {
        tracing::trace!(?issue, "issue found");
        ParseError::Invalid {
            path: self.file.path().to_path_buf(),
            issue,
        }
    }

    fn labels(&self, block: &Block, expected: usize) -> Result<Vec<String>, ParseError> {
        if block.labels.len() != expected {
            return Err(self.error(Issue::LabelCount {
                block: block.identifier.to_string(),
                expected,
                found: block.labels.len(),
            }));
        }

        Ok(block
            .labels
            .iter()
            .map(|label| label.as_str().to_string())
            .collect())
    }

    /// Split a block body into attributes, rejecting nested blocks
    fn attributes(&self, block: Block) -> Result<Attributes, ParseError> {
        let block_ident = block.identifier.to_string();
        let mut attributes = Attributes::new();
        for structure in block.body {
            match structure {
                Structure::Attribute(attribute) => {
                    attributes.insert(attribute.key.to_string(), attribute.expr);
                }
                Structure::Block(nested) => {
                    return Err(self.error(Issue::UnexpectedBlock {
                        parent: block_ident,
                        block: nested.identifier.to_string(),
                    }))
                }
            }
        }
        Ok(attributes)
    }

    fn module(&self, block: Block) -> Result<Module, ParseError> {
        let mut module = Module::default();
        for (key, expr) in self.attributes(block)? {
            match key.as_str() {
                "source" => module.source = Some(self.string("module", &key, &expr)?),
                "version" => module.version = Some(self.string("module", &key, &expr)?),
                _ => return Err(self.unknown_attribute("module", key)),
            }
        }
        Ok(module)
    }

    fn backend(&self, block: Block) -> Result<Backend, ParseError> {
        let backend_type = self.labels(&block, 1)?.remove(0);
        Ok(Backend {
            backend_type,
            attributes: self.attributes(block)?,
        })
    }

    fn data(&self, block: Block) -> Result<DataBlock, ParseError> {
        let mut labels = self.labels(&block, 2)?;
        let name = labels.remove(1);
        let data_type = labels.remove(0);
        Ok(DataBlock {
            data_type,
            name,
            body: block.body,
        })
    }

    fn dependency(&self, block: Block) -> Result<Dependency, ParseError> {
        let name = self.labels(&block, 1)?.remove(0);
        let mut dependency = Dependency {
            name,
            source: None,
            backend: None,
            separate_environment: None,
        };

        for structure in block.body {
            match structure {
                Structure::Attribute(attribute) => {
                    let key = attribute.key.to_string();
                    match key.as_str() {
                        "source" => {
                            dependency.source =
                                Some(self.string("dependency", &key, &attribute.expr)?)
                        }
                        "separate_environment" => {
                            dependency.separate_environment =
                                Some(self.bool("dependency", &key, &attribute.expr)?)
                        }
                        _ => return Err(self.unknown_attribute("dependency", key)),
                    }
                }
                Structure::Block(nested) if nested.identifier.as_str() == "backend" => {
                    if dependency.backend.is_some() {
                        return Err(self.error(Issue::DuplicateBlock(format!(
                            "dependency \"{}\" backend",
                            dependency.name
                        ))));
                    }
                    dependency.backend = Some(self.backend(nested)?);
                }
                Structure::Block(nested) => {
                    return Err(self.error(Issue::UnexpectedBlock {
                        parent: "dependency".to_string(),
                        block: nested.identifier.to_string(),
                    }))
                }
            }
        }

        Ok(dependency)
    }

    fn hook(&self, block: Block) -> Result<Hook, ParseError> {
        let hook_type = self.labels(&block, 1)?.remove(0);
        let mut hook = Hook {
            hook_type,
            ..Default::default()
        };

        for (key, expr) in self.attributes(block)? {
            match key.as_str() {
                "trigger" => hook.trigger = Some(self.string("hook", &key, &expr)?),
                "command" => hook.command = Some(self.string("hook", &key, &expr)?),
                "script" => hook.script = Some(self.string("hook", &key, &expr)?),
                "args" => hook.args = self.string_list("hook", &key, &expr)?,
                "set_env" => hook.set_env = Some(self.bool("hook", &key, &expr)?),
                "fail_on_error" => hook.fail_on_error = Some(self.bool("hook", &key, &expr)?),
                "disable_cache" => hook.disable_cache = Some(self.bool("hook", &key, &expr)?),
                _ => return Err(self.unknown_attribute("hook", key)),
            }
        }

        Ok(hook)
    }

    fn unknown_attribute(&self, block: &str, key: String) -> ParseError {
        self.error(Issue::UnknownAttribute {
            block: block.to_string(),
            key,
        })
    }

    fn evaluate(&self, block: &str, key: &str, expr: &Expression) -> Result<hcl::Value, ParseError> {
        context::evaluate(expr, &self.ctx).map_err(|message| {
            self.error(Issue::Evaluation {
                block: block.to_string(),
                key: key.to_string(),
                message,
            })
        })
    }

    fn invalid_type(&self, block: &str, key: &str, expected: &'static str) -> ParseError {
        self.error(Issue::InvalidType {
            block: block.to_string(),
            key: key.to_string(),
            expected,
        })
    }

    fn string(&self, block: &str, key: &str, expr: &Expression) -> Result<String, ParseError> {
        match self.evaluate(block, key, expr)? {
            hcl::Value::String(s) => Ok(s),
            _ => Err(self.invalid_type(block, key, "string")),
        }
    }

    fn bool(&self, block: &str, key: &str, expr: &Expression) -> Result<bool, ParseError> {
        match self.evaluate(block, key, expr)? {
            hcl::Value::Bool(b) => Ok(b),
            _ => Err(self.invalid_type(block, key, "bool")),
        }
    }

    fn string_list(
        &self,
        block: &str,
        key: &str,
        expr: &Expression,
    ) -> Result<Vec<String>, ParseError> {
        let hcl::Value::Array(elements) = self.evaluate(block, key, expr)? else {
            return Err(self.invalid_type(block, key, "list of strings"));
        };

        elements
            .into_iter()
            .map(|element| match element {
                hcl::Value::String(s) => Ok(s),
                hcl::Value::Number(n) => Ok(n.to_string()),
                hcl::Value::Bool(b) => Ok(b.to_string()),
                _ => Err(self.invalid_type(block, key, "list of strings")),
            })
            .collect()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("{}: unable to read file", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: unable to parse hcl", .path.display())]
    Syntax {
        path: PathBuf,
        #[source]
        source: hcl_edit::parser::Error,
    },
    #[error("{}: {issue}", .path.display())]
    Invalid { path: PathBuf, issue: Issue },
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Issue {
    #[error("attributes are not allowed at the root level (found `{0}`)")]
    RootAttribute(String),
    #[error("unknown block `{0}`")]
    UnknownBlock(String),
    #[error("block `{0}` is defined more than once")]
    DuplicateBlock(String),
    #[error("block `{block}` expects {expected} label(s) but has {found}")]
    LabelCount {
        block: String,
        expected: usize,
        found: usize,
    },
    #[error("block `{block}` is not allowed inside `{parent}`")]
    UnexpectedBlock { parent: String, block: String },
    #[error("unknown attribute `{key}` in `{block}`")]
    UnknownAttribute { block: String, key: String },
    #[error("`{block}.{key}` must be a {expected}")]
    InvalidType {
        block: String,
        key: String,
        expected: &'static str,
    },
    #[error("unable to evaluate `{block}.{key}`: {message}")]
    Evaluation {
        block: String,
        key: String,
        message: String,
    },
}

/// Utility macro to parse descriptors in tests
///
/// Parse a single document (as `/work/main.hcl`)
/// ```
/// # use tfstack::descriptor;
/// let descriptor = descriptor!(r#"module { source = "./module" }"#);
/// assert!(descriptor.module.is_some());
/// ```
///
/// Parse multiple documents (path required)
/// ```
/// # use tfstack::descriptor;
/// let partials = descriptor! {
///   "/work/common_auto.hcl" => r#"inputs { region = "west" }"#,
///   "/work/main.hcl" => r#"module { source = "./module" }"#
/// };
/// assert_eq!(partials.len(), 2);
/// ```
///
/// # Panic
/// Panics on invalid input
#[macro_export]
macro_rules! descriptor {
    // single document
    { $content:expr } => {
        $crate::descriptor::Descriptor::parse(
            $content,
            &$crate::context::FileContext::new("/work/main.hcl".into()),
        )
        .expect("descriptor must parse")
    };
    // multiple documents with paths
    { $($path:expr => $content:expr),+ } => {
        vec![
            $(
                $crate::descriptor::Descriptor::parse(
                    $content,
                    &$crate::context::FileContext::new($path.into()),
                )
                .expect("descriptor must parse"),
            )+
        ]
    };
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn issue_for(content: &str) -> Issue {
        match Descriptor::parse(content, &FileContext::new("/work/main.hcl".into())) {
            Err(ParseError::Invalid { issue, .. }) => issue,
            other => panic!("expected an issue, got {other:?}"),
        }
    }

    #[test]
    fn parses_all_blocks() {
        let descriptor = descriptor!(
            r#"
            module {
              source  = "../modules/${source.name}"
              version = "1.0.0"
            }

            backend "azurerm" {
              key = "${source.name}.tfstate"
            }

            data "azurerm_client_config" "current" {}

            dependency "network" {
              source = "../network"
              separate_environment = true
              backend "azurerm" {
                key = "network.tfstate"
              }
            }

            hook "lint" {
              trigger = "prepare:plan"
              command = "./lint.sh"
              args    = ["--strict", 1]
              set_env = true
            }

            environment_variables {
              TF_IN_AUTOMATION = "1"
            }

            inputs {
              vnet_id = dependency.network.outputs.vnet_id
            }
            "#
        );

        assert_eq!(
            descriptor.module,
            Some(Module {
                source: Some("../modules/main".into()),
                version: Some("1.0.0".into()),
            })
        );
        assert_eq!(
            descriptor.backend.as_ref().map(|b| b.backend_type.as_str()),
            Some("azurerm")
        );
        assert_eq!(descriptor.data[0].key(), ("azurerm_client_config", "current"));

        let network = descriptor.dependency("network").unwrap();
        assert_eq!(network.source.as_deref(), Some("../network"));
        assert_eq!(network.separate_environment, Some(true));
        assert!(network.backend.is_some());

        assert_eq!(
            descriptor.hooks,
            vec![Hook {
                hook_type: "lint".into(),
                trigger: Some("prepare:plan".into()),
                command: Some("./lint.sh".into()),
                args: vec!["--strict".into(), "1".into()],
                set_env: Some(true),
                ..Default::default()
            }]
        );
        assert!(descriptor.inputs.unwrap().contains_key("vnet_id"));
    }

    #[test]
    fn root_attribute_errors() {
        assert_eq!(issue_for("root = 1"), Issue::RootAttribute("root".into()));
    }

    #[test]
    fn unknown_block_errors() {
        assert_eq!(
            issue_for("locals {}"),
            Issue::UnknownBlock("locals".into())
        );
    }

    #[test]
    fn dependency_names_are_unique() {
        assert_eq!(
            issue_for(
                r#"
                dependency "a" { source = "../a" }
                dependency "a" { source = "../b" }
                "#
            ),
            Issue::DuplicateBlock("dependency \"a\"".into())
        );
    }

    #[test]
    fn label_count_is_checked() {
        assert_eq!(
            issue_for(r#"data "only_type" {}"#),
            Issue::LabelCount {
                block: "data".into(),
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn structural_fields_are_typed() {
        assert!(matches!(
            issue_for(r#"module { source = 42 }"#),
            Issue::InvalidType { .. }
        ));
        assert!(matches!(
            issue_for(r#"module { source = unknown.value }"#),
            Issue::Evaluation { .. }
        ));
    }

    #[test]
    fn syntax_errors_keep_path() {
        let err = Descriptor::parse("not = valid = hcl", &FileContext::new("/x/y.hcl".into()))
            .unwrap_err();
        assert!(matches!(err, ParseError::Syntax { .. }));
        assert!(err.to_string().starts_with("/x/y.hcl"));
    }

    #[test]
    fn post_process_resolves_relative_hooks() {
        let mut descriptor = descriptor!(
            r#"
            hook "a" {
              trigger = "prepare"
              command = "./scripts/../lint.sh"
            }
            hook "b" {
              trigger = "prepare"
              command = "terraform"
            }
            "#
        );
        descriptor.post_process();

        assert_eq!(descriptor.hooks[0].command.as_deref(), Some("/work/lint.sh"));
        assert_eq!(descriptor.hooks[1].command.as_deref(), Some("terraform"));
    }
}
