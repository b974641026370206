//! # tfstack - dependency-aware terraform orchestration
//!
//! For usage of the command line tool see the README.
//!
//! ## Introduction for developers
//!
//! Read this to understand how `tfstack` works internally.
//!
//! ### Descriptors and units
//!
//! A descriptor is an HCL file describing one deployment unit:
//!
//! ```hcl
//! module {
//!   source = "../modules/app"
//! }
//!
//! backend "azurerm" {
//!   key = "${source.name}.tfstate"
//! }
//!
//! dependency "network" {
//!   source = "../network/main.hcl"
//! }
//!
//! inputs {
//!   vnet_id = dependency.network.outputs.vnet_id
//! }
//! ```
//!
//! Directories can contribute shared partial descriptors through auto imports (`*_auto.hcl`
//! files, see [auto_import]). Everything contributing to one unit is merged block by block into
//! a single [descriptor::Descriptor], see [descriptor::Descriptor::merge].
//!
//! ### Loading
//!
//! [loader::Loader] discovers descriptor files for the path arguments, merges them and follows
//! `dependency` blocks until all units are loaded ([loader::Units]). [graph::ExecutionGraph]
//! then orders the units so dependencies run first and rejects cycles.
//!
//! ### Generation
//!
//! Inputs can't be evaluated directly since they refer to outputs of other units and to data
//! sources. [generate::Generator] finds every traversal the inputs use ([traversal]), writes a
//! small artifact per referenced dependency (a remote state lookup) and one for the data
//! sources, runs them through the provisioner and folds the `output -json` result back into a
//! [tree::ValueTree]. The inputs are then evaluated against that tree and written as
//! `terraform.tfvars`.
//!
//! Only referenced values are ever looked up. A dependency that was never deployed is not an
//! error, the unit is reported as unresolved and [run::Runner] skips it.
//!
//! ### Running
//!
//! Per unit in graph order [run::Runner] copies the module into the unit's working directory,
//! runs `prepare` hooks ([hooks]), writes the backend override and variables, runs the
//! provisioner command and finally the `finish` hooks.
//!
//! Every process goes through [exec::ProcessExecutor] and every download through
//! [source::SourceGetter], which is how the tests run without terraform installed.
pub mod auto_import;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod exec;
pub mod files;
mod functions;
pub mod generate;
pub mod graph;
pub mod hooks;
pub mod loader;
pub mod provisioner;
pub mod run;
pub mod source;
pub mod traversal;
pub mod tree;
mod util;
pub mod value;
mod visit;
