//! expression context of a descriptor file
use crate::functions;
use hcl::eval::{Context, Evaluate};
use std::path::{Path, PathBuf};

/// The file an expression was written in
///
/// Exposed to expressions as
/// - `source.path`: directory containing the file
/// - `source.name`: file name without extension
/// - `source.filename`: file name
#[derive(Debug, Clone, PartialEq, derive_new::new)]
pub struct FileContext {
    path: PathBuf,
}

impl FileContext {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("/"))
    }

    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn source_value(&self) -> hcl::Value {
        let source: hcl::value::Map<String, hcl::Value> = [
            ("path", self.directory().display().to_string()),
            ("name", self.name()),
            ("filename", self.filename()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), hcl::Value::String(value)))
        .collect();

        hcl::Value::Object(source)
    }

    /// Evaluation context with `source` and the built-in functions
    pub fn eval_context(&self) -> Context<'static> {
        let mut ctx = Context::new();
        ctx.declare_var("source", self.source_value());
        functions::declare_builtins(&mut ctx);
        ctx
    }
}

/// Evaluate an expression and describe the failure as text
pub fn evaluate(expr: &hcl::Expression, ctx: &Context) -> Result<hcl::Value, String> {
    expr.evaluate(ctx).map_err(|errors| errors.to_string())
}
