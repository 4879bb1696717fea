//! 工具层：注册表、参数校验、信封与执行器，以及 GitHub / NPM 工具集

pub mod envelope;
pub mod executor;
pub mod github;
pub mod http;
pub mod npm;
pub mod params;
pub mod registry;
pub mod schema;

pub use envelope::{Envelope, ToolError, ToolErrorKind};
pub use executor::ToolExecutor;
pub use github::{register_github_tools, GithubClient, GithubOp, GithubTool};
pub use npm::{register_npm_tools, NpmClient, NpmOp, NpmTool};
pub use registry::{
    descriptors_schema_json, ParamKind, ParamSpec, RegistryError, Tool, ToolDescriptor, ToolRegistry,
};
pub use schema::tool_call_schema_json;
