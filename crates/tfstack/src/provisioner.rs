//! version dependent behavior of the provisioner binary
use crate::exec::{ExecError, ExecOptions, ProcessExecutor};
use hcl::{Block, Body, Expression};
use indexmap::IndexMap;
use regex::Regex;
use std::sync::LazyLock;

static VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"v?(\d+)\.(\d+)\.(\d+)").expect("version pattern is valid")
});

/// Capability set, selected once from the detected version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioner {
    /// 0.12: provider constraints are plain version strings
    Legacy,
    /// 0.13 and later: `required_providers` entries carry `source` and `version`
    Modern,
}

impl Provisioner {
    /// Run `<binary> version` and pick the capability set
    pub fn detect(executor: &dyn ProcessExecutor, binary: &str) -> Result<Self, ProvisionerError> {
        let mut first_line = None;
        let mut on_stdout = |line: &str| {
            if first_line.is_none() && !line.trim().is_empty() {
                first_line = Some(line.to_string());
            }
        };

        executor.execute(
            ExecOptions {
                stdout: Some(&mut on_stdout),
                ..Default::default()
            },
            binary,
            &["version".to_string()],
        )?;

        let output = first_line.unwrap_or_default();
        let provisioner = Self::from_version(&output)?;
        tracing::info!(version=%output.trim(), ?provisioner, "detected provisioner");
        Ok(provisioner)
    }

    /// Parse a version string such as `Terraform v1.5.7`
    pub fn from_version(version: &str) -> Result<Self, ProvisionerError> {
        let captures = VERSION
            .captures(version)
            .ok_or_else(|| ProvisionerError::UnknownVersion(version.to_string()))?;

        let number = |index: usize| -> Result<u64, ProvisionerError> {
            captures[index]
                .parse()
                .map_err(|_| ProvisionerError::UnknownVersion(version.to_string()))
        };

        match (number(1)?, number(2)?) {
            (0, minor) if minor < 12 => Err(ProvisionerError::Unsupported(version.to_string())),
            (0, 12) => Ok(Provisioner::Legacy),
            _ => Ok(Provisioner::Modern),
        }
    }

    /// `terraform` block pinning the providers used by data sources, plus the provider blocks
    /// some providers insist on
    ///
    /// `providers` maps a provider name to an optional version constraint.
    pub fn compatibility_shim(&self, providers: &IndexMap<String, Option<String>>) -> Body {
        let required: Vec<hcl::Attribute> = providers
            .iter()
            .filter_map(|(name, version)| {
                let constraint = match (self, version) {
                    (Provisioner::Legacy, Some(version)) => Expression::String(version.clone()),
                    (Provisioner::Legacy, None) => return None,
                    (Provisioner::Modern, version) => {
                        let mut entry = hcl::Object::new();
                        entry.insert(
                            hcl::ObjectKey::from(hcl::Identifier::unchecked("source")),
                            Expression::String(format!("hashicorp/{name}")),
                        );
                        if let Some(version) = version {
                            entry.insert(
                                hcl::ObjectKey::from(hcl::Identifier::unchecked("version")),
                                Expression::String(version.clone()),
                            );
                        }
                        Expression::Object(entry)
                    }
                };
                Some(hcl::Attribute::new(
                    hcl::Identifier::unchecked(name.as_str()),
                    constraint,
                ))
            })
            .collect();

        let mut body = Body::builder();
        if !required.is_empty() {
            let required_providers = required
                .into_iter()
                .fold(Block::builder("required_providers"), |block, attribute| {
                    block.add_attribute(attribute)
                })
                .build();
            body = body.add_block(
                Block::builder("terraform")
                    .add_block(required_providers)
                    .build(),
            );
        }

        if providers.contains_key("azurerm") {
            body = body.add_block(
                Block::builder("provider")
                    .add_label("azurerm")
                    .add_block(Block::builder("features").build())
                    .build(),
            );
        }

        body.build()
    }

    pub fn init_args(&self) -> Vec<String> {
        vec!["init".to_string(), "-input=false".to_string()]
    }

    pub fn apply_args(&self) -> Vec<String> {
        vec![
            "apply".to_string(),
            "-auto-approve".to_string(),
            "-input=false".to_string(),
        ]
    }

    pub fn output_args(&self) -> Vec<String> {
        vec!["output".to_string(), "-json".to_string()]
    }
}

/// Provider of a resource or data source type (`azurerm_client_config` -> `azurerm`)
pub fn provider_of(data_type: &str) -> &str {
    data_type
        .split_once('_')
        .map(|(provider, _)| provider)
        .unwrap_or(data_type)
}

#[derive(thiserror::Error, Debug)]
pub enum ProvisionerError {
    #[error("unable to determine the provisioner version from `{0}`")]
    UnknownVersion(String),
    #[error("provisioner version `{0}` is not supported (0.12 or later required)")]
    Unsupported(String),
    #[error("unable to run the provisioner")]
    Exec(#[from] ExecError),
}
