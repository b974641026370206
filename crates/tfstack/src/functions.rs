//! functions available to every descriptor expression
use hcl::eval::{Context, FuncArgs, FuncDef, ParamType};
use hcl::Value;

/// Declare all built-in functions in `ctx`
pub fn declare_builtins(ctx: &mut Context) {
    ctx.declare_func("lower", FuncDef::builder().param(ParamType::String).build(lower));
    ctx.declare_func("upper", FuncDef::builder().param(ParamType::String).build(upper));
    ctx.declare_func(
        "trimspace",
        FuncDef::builder().param(ParamType::String).build(trimspace),
    );
    ctx.declare_func(
        "replace",
        FuncDef::builder()
            .param(ParamType::String)
            .param(ParamType::String)
            .param(ParamType::String)
            .build(replace),
    );
    ctx.declare_func(
        "join",
        FuncDef::builder()
            .param(ParamType::String)
            .param(ParamType::Any)
            .build(join),
    );
    ctx.declare_func(
        "split",
        FuncDef::builder()
            .param(ParamType::String)
            .param(ParamType::String)
            .build(split),
    );
    ctx.declare_func(
        "concat",
        FuncDef::builder().variadic_param(ParamType::Any).build(concat),
    );
    ctx.declare_func(
        "merge",
        FuncDef::builder().variadic_param(ParamType::Any).build(merge),
    );
    ctx.declare_func(
        "coalesce",
        FuncDef::builder().variadic_param(ParamType::Any).build(coalesce),
    );
    ctx.declare_func("env", FuncDef::builder().param(ParamType::String).build(env));
    ctx.declare_func(
        "basename",
        FuncDef::builder().param(ParamType::String).build(basename),
    );
    ctx.declare_func(
        "dirname",
        FuncDef::builder().param(ParamType::String).build(dirname),
    );
}

fn string_arg(args: &FuncArgs, index: usize) -> Result<&str, String> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("argument {index} must be a string"))
}

fn lower(args: FuncArgs) -> Result<Value, String> {
    Ok(string_arg(&args, 0)?.to_lowercase().into())
}

fn upper(args: FuncArgs) -> Result<Value, String> {
    Ok(string_arg(&args, 0)?.to_uppercase().into())
}

fn trimspace(args: FuncArgs) -> Result<Value, String> {
    Ok(string_arg(&args, 0)?.trim().into())
}

fn replace(args: FuncArgs) -> Result<Value, String> {
    let subject = string_arg(&args, 0)?;
    let search = string_arg(&args, 1)?;
    let replacement = string_arg(&args, 2)?;
    Ok(subject.replace(search, replacement).into())
}

fn join(args: FuncArgs) -> Result<Value, String> {
    let separator = string_arg(&args, 0)?;
    let list = args
        .get(1)
        .and_then(Value::as_array)
        .ok_or("second argument must be a list")?;

    let parts = list
        .iter()
        .map(|element| match element {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(format!("cannot join element {other:?}")),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(parts.join(separator).into())
}

fn split(args: FuncArgs) -> Result<Value, String> {
    let separator = string_arg(&args, 0)?;
    let subject = string_arg(&args, 1)?;
    Ok(Value::Array(
        subject.split(separator).map(Value::from).collect(),
    ))
}

fn concat(args: FuncArgs) -> Result<Value, String> {
    let mut result = vec![];
    for arg in args.iter() {
        let list = arg.as_array().ok_or("all arguments must be lists")?;
        result.extend(list.iter().cloned());
    }
    Ok(Value::Array(result))
}

fn merge(args: FuncArgs) -> Result<Value, String> {
    let mut result = hcl::value::Map::new();
    for arg in args.iter() {
        if arg.is_null() {
            continue;
        }
        let object = arg.as_object().ok_or("all arguments must be objects")?;
        for (key, value) in object {
            result.insert(key.clone(), value.clone());
        }
    }
    Ok(Value::Object(result))
}

fn coalesce(args: FuncArgs) -> Result<Value, String> {
    args.iter()
        .find(|arg| match arg {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        })
        .cloned()
        .ok_or_else(|| "no non-null, non-empty argument".to_string())
}

fn env(args: FuncArgs) -> Result<Value, String> {
    let name = string_arg(&args, 0)?;
    Ok(std::env::var(name).map(Value::from).unwrap_or(Value::Null))
}

fn basename(args: FuncArgs) -> Result<Value, String> {
    let path = std::path::Path::new(string_arg(&args, 0)?);
    Ok(path
        .file_name()
        .map(|name| Value::from(name.to_string_lossy().to_string()))
        .unwrap_or_else(|| Value::from("")))
}

fn dirname(args: FuncArgs) -> Result<Value, String> {
    let path = std::path::Path::new(string_arg(&args, 0)?);
    Ok(path
        .parent()
        .map(|parent| Value::from(parent.to_string_lossy().to_string()))
        .unwrap_or_else(|| Value::from(".")))
}
