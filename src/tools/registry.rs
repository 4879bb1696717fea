//! 工具注册表
//!
//! 每个工具由 ToolDescriptor（名称、参数、描述、主题类型）与 Tool 实现组成，
//! 按注册顺序保存，list_descriptors 的输出顺序稳定，便于复现 prompt。
//! 注册表不解释参数与结果。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::gateway::SubjectKind;
use crate::tools::ToolError;

/// 工具 trait：异步执行（params 为 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    async fn execute(&self, params: Value) -> Result<Value, ToolError>;
}

/// 参数类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "values")]
pub enum ParamKind {
    String,
    Integer,
    Enum(Vec<String>),
}

/// 单个参数声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    fn json_schema(&self) -> Value {
        match &self.kind {
            ParamKind::String => json!({"type": "string", "description": self.description}),
            ParamKind::Integer => json!({"type": "integer", "description": self.description}),
            ParamKind::Enum(values) => {
                json!({"type": "string", "enum": values, "description": self.description})
            }
        }
    }
}

/// 工具静态元数据：进程启动时注册一次，此后只读
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    /// 需要仓库或包作为主题时对应的参数（repo_path / package_name）
    pub subject: Option<SubjectKind>,
}

impl ToolDescriptor {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params: Vec::new(),
            subject: None,
        }
    }

    /// 声明主题参数（必填，位于参数表首位）
    pub fn with_subject(mut self, kind: SubjectKind) -> Self {
        let spec = match kind {
            SubjectKind::Repository => ParamSpec::required(
                kind.param_name(),
                ParamKind::String,
                "Repository path in format 'owner/repo'",
            ),
            SubjectKind::Package => {
                ParamSpec::required(kind.param_name(), ParamKind::String, "The NPM package name")
            }
        };
        self.params.insert(0, spec);
        self.subject = Some(kind);
        self
    }

    pub fn with_param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    pub fn parameters_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .params
            .iter()
            .map(|p| (p.name.clone(), p.json_schema()))
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

struct Entry {
    descriptor: ToolDescriptor,
    tool: Arc<dyn Tool>,
}

/// 工具注册表：按注册顺序存储，另建名称索引
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        descriptor: ToolDescriptor,
        tool: Arc<dyn Tool>,
    ) -> Result<(), RegistryError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTool(descriptor.name));
        }
        self.index.insert(descriptor.name.clone(), self.entries.len());
        self.entries.push(Entry { descriptor, tool });
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, RegistryError> {
        self.index
            .get(name)
            .map(|&i| self.entries[i].tool.clone())
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.entries[i].descriptor)
    }

    /// 所有描述符，按注册顺序
    pub fn list_descriptors(&self) -> Vec<ToolDescriptor> {
        self.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.descriptor.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 工具 schema JSON，拼入 system prompt
    pub fn to_schema_json(&self) -> String {
        descriptors_schema_json(&self.list_descriptors())
    }
}

pub fn descriptors_schema_json(descriptors: &[ToolDescriptor]) -> String {
    let tools: Vec<Value> = descriptors
        .iter()
        .map(|d| {
            json!({
                "name": d.name,
                "description": d.description,
                "parameters": d.parameters_schema()
            })
        })
        .collect();
    serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
}
