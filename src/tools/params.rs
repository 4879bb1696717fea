//! 参数校验与读取
//!
//! validate_params 按 ToolDescriptor 检查参数（必须是 JSON 对象、必填项存在、类型与枚举值合法）；
//! 工具实现用 get_str / get_u64 等读取已校验的参数。整数参数也接受纯数字字符串（LLM 常这样输出）。

use serde_json::{Map, Value};

use crate::tools::registry::{ParamKind, ToolDescriptor};
use crate::tools::ToolError;

fn as_integer(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 按描述符校验参数
pub fn validate_params(descriptor: &ToolDescriptor, params: &Value) -> Result<(), ToolError> {
    let obj = params.as_object().ok_or_else(|| {
        ToolError::validation(format!(
            "parameters for '{}' must be a JSON object",
            descriptor.name
        ))
    })?;

    for spec in &descriptor.params {
        let value = match obj.get(&spec.name) {
            None | Some(Value::Null) => {
                if spec.required {
                    return Err(ToolError::validation(format!(
                        "missing required parameter '{}' for '{}'",
                        spec.name, descriptor.name
                    )));
                }
                continue;
            }
            Some(v) => v,
        };
        match &spec.kind {
            ParamKind::String => {
                if !value.is_string() {
                    return Err(ToolError::validation(format!(
                        "parameter '{}' must be a string",
                        spec.name
                    )));
                }
            }
            ParamKind::Integer => {
                if as_integer(value).is_none() {
                    return Err(ToolError::validation(format!(
                        "parameter '{}' must be an integer",
                        spec.name
                    )));
                }
            }
            ParamKind::Enum(allowed) => {
                let ok = value
                    .as_str()
                    .map(|s| allowed.iter().any(|a| a == s))
                    .unwrap_or(false);
                if !ok {
                    return Err(ToolError::validation(format!(
                        "parameter '{}' must be one of: {}",
                        spec.name,
                        allowed.join(", ")
                    )));
                }
            }
        }
    }
    Ok(())
}

fn object(params: &Value) -> Result<&Map<String, Value>, ToolError> {
    params
        .as_object()
        .ok_or_else(|| ToolError::validation("parameters must be a JSON object"))
}

/// 必填字符串参数
pub fn get_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    opt_str(params, name)?
        .ok_or_else(|| ToolError::validation(format!("missing required parameter '{name}'")))
}

pub fn opt_str<'a>(params: &'a Value, name: &str) -> Result<Option<&'a str>, ToolError> {
    match object(params)?.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ToolError::validation(format!(
            "parameter '{name}' must be a string"
        ))),
    }
}

/// 必填正整数参数（>= 1），如 issue_number / pr_number
pub fn get_positive(params: &Value, name: &str) -> Result<u64, ToolError> {
    let n = opt_integer(params, name)?
        .ok_or_else(|| ToolError::validation(format!("missing required parameter '{name}'")))?;
    if n < 1 {
        return Err(ToolError::validation(format!(
            "parameter '{name}' must be >= 1, got {n}"
        )));
    }
    Ok(n as u64)
}

pub fn opt_integer(params: &Value, name: &str) -> Result<Option<i64>, ToolError> {
    match object(params)?.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => as_integer(v).map(Some).ok_or_else(|| {
            ToolError::validation(format!("parameter '{name}' must be an integer"))
        }),
    }
}

/// 可选上限参数，限制在 [1, max]，缺省为 default
pub fn limit_param(params: &Value, name: &str, default: usize, max: usize) -> Result<usize, ToolError> {
    match opt_integer(params, name)? {
        None => Ok(default),
        Some(n) if n < 1 => Err(ToolError::validation(format!(
            "parameter '{name}' must be >= 1, got {n}"
        ))),
        Some(n) => Ok((n as usize).min(max)),
    }
}
