//! NPM 工具集
//!
//! 通过 npm registry、downloads API 与 npms.io 查询包信息、版本、下载量、被依赖数与评分。

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::gateway::{validate_package_name, SubjectKind};
use crate::tools::http::{build_client, send_json, with_context};
use crate::tools::params::{get_str, limit_param, opt_str};
use crate::tools::registry::{ParamKind, ParamSpec, RegistryError, Tool, ToolDescriptor, ToolRegistry};
use crate::tools::ToolError;

pub const DEFAULT_REGISTRY_BASE: &str = "https://registry.npmjs.org";
pub const DEFAULT_DOWNLOADS_BASE: &str = "https://api.npmjs.org";
pub const DEFAULT_NPMS_BASE: &str = "https://api.npms.io";

const SEARCH_MAX: usize = 50;
/// get_package_versions 最多返回的版本数（取最新的）
const MAX_VERSIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpmOp {
    GetPackageInfo,
    GetPackageVersions,
    SearchPackages,
    GetDownloadsStats,
    GetDependentsCount,
    GetPackageScore,
}

impl NpmOp {
    pub const ALL: [NpmOp; 6] = [
        NpmOp::GetPackageInfo,
        NpmOp::GetPackageVersions,
        NpmOp::SearchPackages,
        NpmOp::GetDownloadsStats,
        NpmOp::GetDependentsCount,
        NpmOp::GetPackageScore,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NpmOp::GetPackageInfo => "get_package_info",
            NpmOp::GetPackageVersions => "get_package_versions",
            NpmOp::SearchPackages => "search_packages",
            NpmOp::GetDownloadsStats => "get_downloads_stats",
            NpmOp::GetDependentsCount => "get_dependents_count",
            NpmOp::GetPackageScore => "get_package_score",
        }
    }

    pub fn descriptor(self) -> ToolDescriptor {
        match self {
            NpmOp::GetPackageInfo => ToolDescriptor::new(
                self.name(),
                "Fetch metadata for an NPM package (description, latest version, license, maintainers).",
            )
            .with_subject(SubjectKind::Package),
            NpmOp::GetPackageVersions => ToolDescriptor::new(
                self.name(),
                "List the published versions of an NPM package.",
            )
            .with_subject(SubjectKind::Package),
            NpmOp::SearchPackages => ToolDescriptor::new(
                self.name(),
                "Search NPM packages by keyword or name.",
            )
            .with_param(ParamSpec::required("query", ParamKind::String, "The search query string"))
            .with_param(ParamSpec::optional(
                "limit",
                ParamKind::Integer,
                &format!("Maximum number of results (default 10, max {SEARCH_MAX})"),
            )),
            NpmOp::GetDownloadsStats => ToolDescriptor::new(
                self.name(),
                "Download counts for an NPM package over a period.",
            )
            .with_subject(SubjectKind::Package)
            .with_param(ParamSpec::optional(
                "period",
                ParamKind::Enum(vec!["last-day".into(), "last-week".into(), "last-month".into()]),
                "'last-day', 'last-week' or 'last-month' (default)",
            )),
            NpmOp::GetDependentsCount => ToolDescriptor::new(
                self.name(),
                "Number of packages that depend on the given package (npms.io).",
            )
            .with_subject(SubjectKind::Package),
            NpmOp::GetPackageScore => ToolDescriptor::new(
                self.name(),
                "Quality, maintenance and popularity scores of a package (npms.io).",
            )
            .with_subject(SubjectKind::Package),
        }
    }
}

/// npm 相关 API 的客户端
pub struct NpmClient {
    http: Client,
    registry_base: String,
    downloads_base: String,
    npms_base: String,
}

impl NpmClient {
    pub fn new(
        registry_base: &str,
        downloads_base: &str,
        npms_base: &str,
        timeout_secs: u64,
    ) -> Result<Self, ToolError> {
        Ok(Self {
            http: build_client(timeout_secs)?,
            registry_base: registry_base.trim_end_matches('/').to_string(),
            downloads_base: downloads_base.trim_end_matches('/').to_string(),
            npms_base: npms_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn with_defaults(timeout_secs: u64) -> Result<Self, ToolError> {
        Self::new(
            DEFAULT_REGISTRY_BASE,
            DEFAULT_DOWNLOADS_BASE,
            DEFAULT_NPMS_BASE,
            timeout_secs,
        )
    }

    async fn packument(&self, name: &str) -> Result<Value, ToolError> {
        // registry 要求 scope 与包名之间的 '/' 编码
        let url = format!("{}/{}", self.registry_base, name.replace('/', "%2F"));
        send_json(self.http.get(url)).await
    }

    async fn npms(&self, name: &str) -> Result<Value, ToolError> {
        let encoded = name.replace('@', "%40").replace('/', "%2F");
        send_json(self.http.get(format!("{}/v2/package/{}", self.npms_base, encoded))).await
    }

    async fn search(&self, params: &Value) -> Result<Value, ToolError> {
        let query = get_str(params, "query")?;
        if query.trim().is_empty() {
            return Err(ToolError::validation("query must not be empty"));
        }
        let size = limit_param(params, "limit", 10, SEARCH_MAX)?;
        let data = send_json(
            self.http
                .get(format!("{}/-/v1/search", self.registry_base))
                .query(&[("text", query.to_string()), ("size", size.to_string())]),
        )
        .await
        .map_err(|e| with_context(e, &format!("searching for packages with query '{query}'")))?;
        Ok(project_search(&data))
    }

    async fn run(&self, op: NpmOp, params: &Value) -> Result<Value, ToolError> {
        let package = || {
            get_str(params, "package_name").and_then(|raw| {
                validate_package_name(raw).map_err(|e| ToolError::validation(e.to_string()))
            })
        };

        match op {
            NpmOp::SearchPackages => self.search(params).await,
            NpmOp::GetPackageInfo => {
                let name = package()?;
                let data = self
                    .packument(&name)
                    .await
                    .map_err(|e| with_context(e, &format!("fetching info for package '{name}'")))?;
                Ok(project_info(&data))
            }
            NpmOp::GetPackageVersions => {
                let name = package()?;
                let data = self
                    .packument(&name)
                    .await
                    .map_err(|e| with_context(e, &format!("fetching versions for package '{name}'")))?;
                let mut all: Vec<&str> = data
                    .get("versions")
                    .and_then(|v| v.as_object())
                    .map(|m| m.keys().map(String::as_str).collect())
                    .unwrap_or_default();
                all.sort_by_cached_key(|v| version_key(v));
                let total = all.len();
                let versions = &all[total.saturating_sub(MAX_VERSIONS)..];
                Ok(json!({
                    "name": name,
                    "latest": data.pointer("/dist-tags/latest"),
                    "total_versions": total,
                    "versions": versions,
                }))
            }
            NpmOp::GetDownloadsStats => {
                let name = package()?;
                let period = opt_str(params, "period")?.unwrap_or("last-month");
                send_json(
                    self.http
                        .get(format!("{}/downloads/point/{}/{}", self.downloads_base, period, name)),
                )
                .await
                .map_err(|e| with_context(e, &format!("fetching download stats for package '{name}'")))
            }
            NpmOp::GetDependentsCount => {
                let name = package()?;
                let data = self
                    .npms(&name)
                    .await
                    .map_err(|e| with_context(e, &format!("fetching dependents count for package '{name}'")))?;
                Ok(json!({
                    "name": name,
                    "dependents_count": data.pointer("/collected/npm/dependentsCount"),
                }))
            }
            NpmOp::GetPackageScore => {
                let name = package()?;
                let data = self
                    .npms(&name)
                    .await
                    .map_err(|e| with_context(e, &format!("fetching score for package '{name}'")))?;
                Ok(json!({
                    "name": name,
                    "score": data.get("score").cloned().unwrap_or_else(|| json!({})),
                }))
            }
        }
    }
}

/// semver 排序键：major.minor.patch 数值比较，预发布版本排在正式版之前
fn version_key(v: &str) -> (u64, u64, u64, bool, String) {
    let (core, pre) = match v.split_once('-') {
        Some((c, p)) => (c, Some(p)),
        None => (v, None),
    };
    let mut parts = core.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        pre.is_none(),
        pre.unwrap_or_default().to_string(),
    )
}

fn project_info(data: &Value) -> Value {
    let text_or_name = |v: Option<&Value>| match v {
        Some(Value::String(s)) => Value::String(s.clone()),
        Some(obj) => obj.get("name").or_else(|| obj.get("url")).cloned().unwrap_or(Value::Null),
        None => Value::Null,
    };
    let maintainers: Vec<Value> = data
        .get("maintainers")
        .and_then(|m| m.as_array())
        .map(|a| a.iter().filter_map(|m| m.get("name").cloned()).collect())
        .unwrap_or_default();
    json!({
        "name": data.get("name"),
        "description": data.get("description"),
        "latest_version": data.pointer("/dist-tags/latest"),
        "homepage": data.get("homepage"),
        "repository": text_or_name(data.get("repository")),
        "license": text_or_name(data.get("license")),
        "author": text_or_name(data.get("author")),
        "maintainers": maintainers,
        "keywords": data.get("keywords"),
    })
}

fn project_search(data: &Value) -> Value {
    let results: Vec<Value> = data
        .get("objects")
        .and_then(|o| o.as_array())
        .map(|objs| {
            objs.iter()
                .map(|o| {
                    let p = o.get("package").cloned().unwrap_or_else(|| json!({}));
                    json!({
                        "name": p.get("name"),
                        "version": p.get("version"),
                        "description": p.get("description"),
                        "links": p.get("links").cloned().unwrap_or_else(|| json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Value::Array(results)
}

pub struct NpmTool {
    op: NpmOp,
    client: Arc<NpmClient>,
}

impl NpmTool {
    pub fn new(op: NpmOp, client: Arc<NpmClient>) -> Self {
        Self { op, client }
    }
}

#[async_trait]
impl Tool for NpmTool {
    async fn execute(&self, params: Value) -> Result<Value, ToolError> {
        self.client.run(self.op, &params).await
    }
}

pub fn register_npm_tools(registry: &mut ToolRegistry, client: Arc<NpmClient>) -> Result<(), RegistryError> {
    for op in NpmOp::ALL {
        registry.register(op.descriptor(), Arc::new(NpmTool::new(op, client.clone())))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_info_handles_string_and_object_fields() {
        let data = json!({
            "name": "left-pad",
            "dist-tags": {"latest": "1.3.0"},
            "repository": {"type": "git", "url": "git+https://github.com/stevemao/left-pad.git"},
            "license": "WTFPL",
            "author": {"name": "azer"},
            "maintainers": [{"name": "stevemao"}],
        });
        let info = project_info(&data);
        assert_eq!(info["latest_version"], "1.3.0");
        assert_eq!(info["repository"], "git+https://github.com/stevemao/left-pad.git");
        assert_eq!(info["license"], "WTFPL");
        assert_eq!(info["author"], "azer");
        assert_eq!(info["maintainers"], json!(["stevemao"]));
    }

    #[test]
    fn test_version_ordering() {
        let mut v = vec!["1.10.0", "1.2.0", "2.0.0-beta.1", "2.0.0", "1.2.0-rc.1"];
        v.sort_by_cached_key(|s| version_key(s));
        assert_eq!(v, vec!["1.2.0-rc.1", "1.2.0", "1.10.0", "2.0.0-beta.1", "2.0.0"]);
    }

    #[test]
    fn test_search_has_no_subject() {
        assert_eq!(NpmOp::SearchPackages.descriptor().subject, None);
        assert_eq!(
            NpmOp::GetDownloadsStats.descriptor().subject,
            Some(SubjectKind::Package)
        );
    }

    #[tokio::test]
    async fn test_invalid_package_name() {
        let client = NpmClient::new("http://127.0.0.1:9", "http://127.0.0.1:9", "http://127.0.0.1:9", 1).unwrap();
        let err = client
            .run(NpmOp::GetPackageInfo, &json!({"package_name": "Not Valid"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::tools::ToolErrorKind::ValidationError);
    }
}
