//! GitHub 工具集
//!
//! 基于 GitHub REST v3 的只读查询（仓库、贡献者、Issue、PR、代码搜索）以及三个写操作
//! （评论 Issue / PR、加标签）。写操作仅在 `tools.github.allow_writes = true` 时注册。
//! 每个工具只投影出回答问题需要的字段。

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Value};

use crate::gateway::{RepoPath, SubjectKind};
use crate::tools::http::{build_client, send_json, with_context};
use crate::tools::params::{get_positive, get_str, limit_param, opt_str};
use crate::tools::registry::{ParamKind, ParamSpec, RegistryError, Tool, ToolDescriptor, ToolRegistry};
use crate::tools::ToolError;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const MAX_PER_PAGE: usize = 100;
/// 列表中每条 body 的最大字符数
const LIST_BODY_CHARS: usize = 500;

/// GitHub 工具种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GithubOp {
    GetRepository,
    GetContributorsInfo,
    GetTopContributors,
    GetIssuesInfo,
    GetIssueInfo,
    GetPullRequestsInfo,
    GetPullRequestInfo,
    GetPullRequestFiles,
    SummarizePullRequest,
    SearchCode,
    CommentOnIssue,
    CommentOnPullRequest,
    AddLabelToIssue,
}

impl GithubOp {
    pub const READ_ONLY: [GithubOp; 10] = [
        GithubOp::GetRepository,
        GithubOp::GetContributorsInfo,
        GithubOp::GetTopContributors,
        GithubOp::GetIssuesInfo,
        GithubOp::GetIssueInfo,
        GithubOp::GetPullRequestsInfo,
        GithubOp::GetPullRequestInfo,
        GithubOp::GetPullRequestFiles,
        GithubOp::SummarizePullRequest,
        GithubOp::SearchCode,
    ];

    pub const WRITES: [GithubOp; 3] = [
        GithubOp::CommentOnIssue,
        GithubOp::CommentOnPullRequest,
        GithubOp::AddLabelToIssue,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GithubOp::GetRepository => "get_repository",
            GithubOp::GetContributorsInfo => "get_contributors_info",
            GithubOp::GetTopContributors => "get_top_contributors",
            GithubOp::GetIssuesInfo => "get_issues_info",
            GithubOp::GetIssueInfo => "get_issue_info",
            GithubOp::GetPullRequestsInfo => "get_pull_requests_info",
            GithubOp::GetPullRequestInfo => "get_pull_request_info",
            GithubOp::GetPullRequestFiles => "get_pull_request_files",
            GithubOp::SummarizePullRequest => "summarize_pull_request",
            GithubOp::SearchCode => "search_code",
            GithubOp::CommentOnIssue => "comment_on_issue",
            GithubOp::CommentOnPullRequest => "comment_on_pull_request",
            GithubOp::AddLabelToIssue => "add_label_to_issue",
        }
    }

    pub fn descriptor(self) -> ToolDescriptor {
        let state = || {
            ParamSpec::optional(
                "state",
                ParamKind::Enum(vec!["open".into(), "closed".into(), "all".into()]),
                "Filter by state: 'open' (default), 'closed' or 'all'",
            )
        };
        let limit = |default: usize| {
            ParamSpec::optional(
                "limit",
                ParamKind::Integer,
                &format!("Maximum number of results (default {default}, max {MAX_PER_PAGE})"),
            )
        };
        let issue_number =
            || ParamSpec::required("issue_number", ParamKind::Integer, "The number of the issue");
        let pr_number = || {
            ParamSpec::required("pr_number", ParamKind::Integer, "The number of the pull request")
        };

        let d = match self {
            GithubOp::GetRepository => ToolDescriptor::new(
                self.name(),
                "Fetch repository details (description, stars, forks, language, license, open issues).",
            ),
            GithubOp::GetContributorsInfo => ToolDescriptor::new(
                self.name(),
                "List contributors of a repository with their contribution counts.",
            )
            .with_param(limit(30)),
            GithubOp::GetTopContributors => ToolDescriptor::new(
                self.name(),
                "Return the top contributors of a repository ranked by number of contributions.",
            )
            .with_param(limit(5)),
            GithubOp::GetIssuesInfo => ToolDescriptor::new(
                self.name(),
                "List issues of a repository (pull requests are excluded).",
            )
            .with_param(state())
            .with_param(limit(30)),
            GithubOp::GetIssueInfo => ToolDescriptor::new(
                self.name(),
                "Fetch a single issue by its number.",
            )
            .with_param(issue_number()),
            GithubOp::GetPullRequestsInfo => ToolDescriptor::new(
                self.name(),
                "List pull requests of a repository.",
            )
            .with_param(state())
            .with_param(limit(30)),
            GithubOp::GetPullRequestInfo => ToolDescriptor::new(
                self.name(),
                "Fetch a single pull request by its number.",
            )
            .with_param(pr_number()),
            GithubOp::GetPullRequestFiles => ToolDescriptor::new(
                self.name(),
                "List the files changed in a pull request.",
            )
            .with_param(pr_number()),
            GithubOp::SummarizePullRequest => ToolDescriptor::new(
                self.name(),
                "Summarize a pull request: title, body, changed files, additions and deletions.",
            )
            .with_param(pr_number()),
            GithubOp::SearchCode => ToolDescriptor::new(
                self.name(),
                "Search code inside the repository.",
            )
            .with_param(ParamSpec::required("query", ParamKind::String, "The search query string")),
            GithubOp::CommentOnIssue => ToolDescriptor::new(
                self.name(),
                "Add a comment to an issue. Only use when the user explicitly asks for it.",
            )
            .with_param(issue_number())
            .with_param(ParamSpec::required("comment", ParamKind::String, "The comment text")),
            GithubOp::CommentOnPullRequest => ToolDescriptor::new(
                self.name(),
                "Add a comment to a pull request. Only use when the user explicitly asks for it.",
            )
            .with_param(pr_number())
            .with_param(ParamSpec::required("comment", ParamKind::String, "The comment text")),
            GithubOp::AddLabelToIssue => ToolDescriptor::new(
                self.name(),
                "Add a label to an issue. Only use when the user explicitly asks for it.",
            )
            .with_param(issue_number())
            .with_param(ParamSpec::required("label", ParamKind::String, "The label to add")),
        };
        d.with_subject(SubjectKind::Repository)
    }
}

/// GitHub REST 客户端
pub struct GithubClient {
    http: Client,
    api_base: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(api_base: &str, token: Option<String>, timeout_secs: u64) -> Result<Self, ToolError> {
        Ok(Self {
            http: build_client(timeout_secs)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.api_base, path))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ToolError> {
        send_json(self.request(Method::GET, path).query(query)).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ToolError> {
        send_json(self.request(Method::POST, path).json(&body)).await
    }

    async fn run(&self, op: GithubOp, params: &Value) -> Result<Value, ToolError> {
        let repo: RepoPath = get_str(params, "repo_path")?
            .parse()
            .map_err(|e: crate::gateway::SubjectError| ToolError::validation(e.to_string()))?;
        let base = format!("/repos/{}/{}", repo.owner, repo.name);

        match op {
            GithubOp::GetRepository => {
                let r = self
                    .get(&base, &[])
                    .await
                    .map_err(|e| with_context(e, &format!("fetching repository {repo}")))?;
                Ok(project_repository(&r))
            }
            GithubOp::GetContributorsInfo | GithubOp::GetTopContributors => {
                let default = if op == GithubOp::GetTopContributors { 5 } else { 30 };
                let limit = limit_param(params, "limit", default, MAX_PER_PAGE)?;
                let list = self
                    .get(&format!("{base}/contributors"), &[("per_page", limit.to_string())])
                    .await
                    .map_err(|e| with_context(e, &format!("fetching contributors for {repo}")))?;
                let mut contributors: Vec<Value> = items(&list).iter().map(project_contributor).collect();
                contributors.sort_by_key(|c| std::cmp::Reverse(c["contributions"].as_u64().unwrap_or(0)));
                contributors.truncate(limit);
                if op == GithubOp::GetTopContributors {
                    Ok(json!({"repository": repo.to_string(), "top_contributors": contributors}))
                } else {
                    Ok(Value::Array(contributors))
                }
            }
            GithubOp::GetIssuesInfo => {
                let state = opt_str(params, "state")?.unwrap_or("open").to_string();
                let limit = limit_param(params, "limit", 30, MAX_PER_PAGE)?;
                let list = self
                    .get(
                        &format!("{base}/issues"),
                        &[("state", state), ("per_page", MAX_PER_PAGE.to_string())],
                    )
                    .await
                    .map_err(|e| with_context(e, &format!("fetching issues for {repo}")))?;
                let issues: Vec<Value> = items(&list)
                    .iter()
                    .filter(|i| i.get("pull_request").is_none())
                    .take(limit)
                    .map(|i| project_issue(i, Some(LIST_BODY_CHARS)))
                    .collect();
                Ok(Value::Array(issues))
            }
            GithubOp::GetIssueInfo => {
                let n = get_positive(params, "issue_number")?;
                let issue = self
                    .get(&format!("{base}/issues/{n}"), &[])
                    .await
                    .map_err(|e| with_context(e, &format!("fetching issue #{n} for {repo}")))?;
                if issue.get("pull_request").is_some() {
                    return Err(ToolError::validation(format!(
                        "Issue #{n} is a pull request, not an issue"
                    )));
                }
                Ok(project_issue(&issue, None))
            }
            GithubOp::GetPullRequestsInfo => {
                let state = opt_str(params, "state")?.unwrap_or("open").to_string();
                let limit = limit_param(params, "limit", 30, MAX_PER_PAGE)?;
                let list = self
                    .get(
                        &format!("{base}/pulls"),
                        &[("state", state), ("per_page", limit.to_string())],
                    )
                    .await
                    .map_err(|e| with_context(e, &format!("fetching pull requests for {repo}")))?;
                let pulls: Vec<Value> = items(&list)
                    .iter()
                    .take(limit)
                    .map(|p| project_pull(p, Some(LIST_BODY_CHARS)))
                    .collect();
                Ok(Value::Array(pulls))
            }
            GithubOp::GetPullRequestInfo => {
                let n = get_positive(params, "pr_number")?;
                let pr = self
                    .get(&format!("{base}/pulls/{n}"), &[])
                    .await
                    .map_err(|e| with_context(e, &format!("fetching pull request #{n} for {repo}")))?;
                Ok(project_pull(&pr, None))
            }
            GithubOp::GetPullRequestFiles => {
                let n = get_positive(params, "pr_number")?;
                let files = self.pull_files(&base, n, &repo).await?;
                Ok(Value::Array(files.iter().map(project_file).collect()))
            }
            GithubOp::SummarizePullRequest => {
                let n = get_positive(params, "pr_number")?;
                let pr = self
                    .get(&format!("{base}/pulls/{n}"), &[])
                    .await
                    .map_err(|e| with_context(e, &format!("summarizing pull request #{n} for {repo}")))?;
                let files = self.pull_files(&base, n, &repo).await?;
                Ok(summarize_pull(&pr, &files))
            }
            GithubOp::SearchCode => {
                let query = get_str(params, "query")?;
                let result = self
                    .get("/search/code", &[("q", format!("{query} repo:{repo}"))])
                    .await
                    .map_err(|e| with_context(e, &format!("searching code in {repo}")))?;
                let hits: Vec<Value> = result
                    .get("items")
                    .map(items)
                    .unwrap_or_default()
                    .iter()
                    .map(|f| {
                        json!({
                            "name": f.get("name"),
                            "path": f.get("path"),
                            "html_url": f.get("html_url"),
                            "repository": f.pointer("/repository/full_name"),
                        })
                    })
                    .collect();
                Ok(Value::Array(hits))
            }
            GithubOp::CommentOnIssue | GithubOp::CommentOnPullRequest => {
                let (param, what) = if op == GithubOp::CommentOnIssue {
                    ("issue_number", "issue")
                } else {
                    ("pr_number", "PR")
                };
                let n = get_positive(params, param)?;
                let comment = get_str(params, "comment")?;
                if comment.trim().is_empty() {
                    return Err(ToolError::validation("comment must not be empty"));
                }
                // PR 的对话评论走 issues 接口
                let created = self
                    .post(&format!("{base}/issues/{n}/comments"), json!({"body": comment}))
                    .await
                    .map_err(|e| with_context(e, &format!("commenting on {what} #{n} for {repo}")))?;
                Ok(json!({"success": true, "comment_url": created.get("html_url")}))
            }
            GithubOp::AddLabelToIssue => {
                let n = get_positive(params, "issue_number")?;
                let label = get_str(params, "label")?;
                let labels = self
                    .post(&format!("{base}/issues/{n}/labels"), json!({"labels": [label]}))
                    .await
                    .map_err(|e| with_context(e, &format!("adding label to issue #{n} for {repo}")))?;
                Ok(json!({"success": true, "labels": label_names(&labels)}))
            }
        }
    }

    async fn pull_files(&self, base: &str, n: u64, repo: &RepoPath) -> Result<Vec<Value>, ToolError> {
        let files = self
            .get(&format!("{base}/pulls/{n}/files"), &[("per_page", MAX_PER_PAGE.to_string())])
            .await
            .map_err(|e| with_context(e, &format!("fetching files for pull request #{n} in {repo}")))?;
        Ok(items(&files).to_vec())
    }
}

fn items(v: &Value) -> &[Value] {
    v.as_array().map(|a| a.as_slice()).unwrap_or(&[])
}

fn login(v: &Value, field: &str) -> Value {
    v.get(field)
        .and_then(|u| u.get("login"))
        .cloned()
        .unwrap_or(Value::Null)
}

fn logins(v: &Value, field: &str) -> Vec<Value> {
    v.get(field)
        .map(items)
        .unwrap_or_default()
        .iter()
        .filter_map(|u| u.get("login").cloned())
        .collect()
}

fn label_names(v: &Value) -> Vec<Value> {
    items(v).iter().filter_map(|l| l.get("name").cloned()).collect()
}

fn body(v: &Value, max_chars: Option<usize>) -> Value {
    match (v.get("body").and_then(|b| b.as_str()), max_chars) {
        (Some(b), Some(max)) if b.chars().count() > max => {
            Value::String(format!("{}...", b.chars().take(max).collect::<String>()))
        }
        (Some(b), _) => Value::String(b.to_string()),
        (None, _) => Value::Null,
    }
}

fn field(v: &Value, name: &str) -> Value {
    v.get(name).cloned().unwrap_or(Value::Null)
}

fn project_repository(r: &Value) -> Value {
    json!({
        "name": field(r, "name"),
        "full_name": field(r, "full_name"),
        "description": field(r, "description"),
        "url": field(r, "html_url"),
        "stars": field(r, "stargazers_count"),
        "forks": field(r, "forks_count"),
        "language": field(r, "language"),
        "open_issues": field(r, "open_issues_count"),
        "default_branch": field(r, "default_branch"),
        "created_at": field(r, "created_at"),
        "updated_at": field(r, "updated_at"),
        "license": r.pointer("/license/name").cloned().unwrap_or(Value::Null),
        "private": field(r, "private"),
        "archived": field(r, "archived"),
    })
}

fn project_contributor(c: &Value) -> Value {
    json!({
        "login": field(c, "login"),
        "avatar_url": field(c, "avatar_url"),
        "html_url": field(c, "html_url"),
        "contributions": field(c, "contributions"),
        "site_admin": c.get("site_admin").cloned().unwrap_or(Value::Bool(false)),
    })
}

fn project_issue(i: &Value, max_body: Option<usize>) -> Value {
    json!({
        "number": field(i, "number"),
        "title": field(i, "title"),
        "state": field(i, "state"),
        "user": login(i, "user"),
        "assignees": logins(i, "assignees"),
        "labels": label_names(&field(i, "labels")),
        "created_at": field(i, "created_at"),
        "updated_at": field(i, "updated_at"),
        "closed_at": field(i, "closed_at"),
        "html_url": field(i, "html_url"),
        "body": body(i, max_body),
    })
}

fn project_pull(p: &Value, max_body: Option<usize>) -> Value {
    let mut v = project_issue(p, max_body);
    if let Some(obj) = v.as_object_mut() {
        obj.insert("merged_at".into(), field(p, "merged_at"));
        obj.insert(
            "merged".into(),
            p.get("merged")
                .cloned()
                .unwrap_or_else(|| Value::Bool(!field(p, "merged_at").is_null())),
        );
        obj.insert("mergeable".into(), field(p, "mergeable"));
    }
    v
}

fn project_file(f: &Value) -> Value {
    json!({
        "filename": field(f, "filename"),
        "status": field(f, "status"),
        "additions": field(f, "additions"),
        "deletions": field(f, "deletions"),
        "changes": field(f, "changes"),
        "raw_url": field(f, "raw_url"),
        "blob_url": field(f, "blob_url"),
    })
}

fn summarize_pull(pr: &Value, files: &[Value]) -> Value {
    let count = |f: &Value, k: &str| f.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
    let additions: u64 = files.iter().map(|f| count(f, "additions")).sum();
    let deletions: u64 = files.iter().map(|f| count(f, "deletions")).sum();
    let file_summaries: Vec<Value> = files
        .iter()
        .map(|f| {
            json!({
                "filename": field(f, "filename"),
                "status": field(f, "status"),
                "additions": field(f, "additions"),
                "deletions": field(f, "deletions"),
            })
        })
        .collect();
    json!({
        "number": field(pr, "number"),
        "title": field(pr, "title"),
        "state": field(pr, "state"),
        "user": login(pr, "user"),
        "created_at": field(pr, "created_at"),
        "merged": field(pr, "merged"),
        "additions": additions,
        "deletions": deletions,
        "files_changed": file_summaries.len(),
        "files": file_summaries,
        "body": body(pr, None),
        "html_url": field(pr, "html_url"),
    })
}

/// 单个 GitHub 工具：共享同一个客户端
pub struct GithubTool {
    op: GithubOp,
    client: Arc<GithubClient>,
}

impl GithubTool {
    pub fn new(op: GithubOp, client: Arc<GithubClient>) -> Self {
        Self { op, client }
    }
}

#[async_trait]
impl Tool for GithubTool {
    async fn execute(&self, params: Value) -> Result<Value, ToolError> {
        self.client.run(self.op, &params).await
    }
}

/// 注册 GitHub 工具；allow_writes 为 false 时不注册评论与加标签
pub fn register_github_tools(
    registry: &mut ToolRegistry,
    client: Arc<GithubClient>,
    allow_writes: bool,
) -> Result<(), RegistryError> {
    let writes: &[GithubOp] = if allow_writes { &GithubOp::WRITES } else { &[] };
    for op in GithubOp::READ_ONLY.iter().chain(writes) {
        registry.register(op.descriptor(), Arc::new(GithubTool::new(*op, client.clone())))?;
    }
    Ok(())
}
