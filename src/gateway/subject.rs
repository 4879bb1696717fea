//! 对话主题：GitHub 仓库（owner/repo）或 NPM 包
//!
//! 用户消息里显式给出的主题会成为会话的 active subject；后续消息省略时沿用。

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 主题类型，对应工具的主题参数名
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Repository,
    Package,
}

impl SubjectKind {
    pub fn param_name(self) -> &'static str {
        match self {
            SubjectKind::Repository => "repo_path",
            SubjectKind::Package => "package_name",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubjectError {
    #[error("'{0}' is not a repository path in the format <owner>/<repo>")]
    InvalidRepoPath(String),
    #[error("'{0}' is not a valid NPM package name")]
    InvalidPackageName(String),
}

fn owner_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,38})$").expect("owner regex"))
}

fn repo_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]{1,100}$").expect("repo regex"))
}

fn package_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:@[a-z0-9][a-z0-9._~-]*/)?[a-z0-9][a-z0-9._~-]*$").expect("package regex")
    })
}

/// GitHub 仓库路径
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoPath {
    pub owner: String,
    pub name: String,
}

impl FromStr for RepoPath {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || SubjectError::InvalidRepoPath(trimmed.to_string());
        let (owner, name) = trimmed.split_once('/').ok_or_else(invalid)?;
        let name = name.strip_suffix(".git").unwrap_or(name);
        if !owner_re().is_match(owner)
            || !repo_name_re().is_match(name)
            || name == "."
            || name == ".."
        {
            return Err(invalid());
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// 校验 NPM 包名（含 @scope/name），返回原样名称
pub fn validate_package_name(s: &str) -> Result<String, SubjectError> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.len() > 214 || !package_re().is_match(trimmed) {
        return Err(SubjectError::InvalidPackageName(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

/// 会话主题
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Repository(RepoPath),
    Package(String),
}

impl Subject {
    pub fn kind(&self) -> SubjectKind {
        match self {
            Subject::Repository(_) => SubjectKind::Repository,
            Subject::Package(_) => SubjectKind::Package,
        }
    }

    /// 作为工具参数值
    pub fn param_value(&self) -> String {
        match self {
            Subject::Repository(r) => r.to_string(),
            Subject::Package(p) => p.clone(),
        }
    }

    /// 按指定类型解析工具参数值
    pub fn parse_as(kind: SubjectKind, value: &str) -> Result<Self, SubjectError> {
        match kind {
            SubjectKind::Repository => value.parse().map(Subject::Repository),
            SubjectKind::Package => validate_package_name(value).map(Subject::Package),
        }
    }

    /// 解析通道传入的显式主题：
    /// `npm:<name>` 或 `@scope/name` 为包；GitHub URL 或 `owner/repo` 为仓库；其余按包名处理
    pub fn parse_explicit(hint: &str) -> Result<Self, SubjectError> {
        let hint = hint.trim();
        if let Some(pkg) = hint.strip_prefix("npm:") {
            return validate_package_name(pkg).map(Subject::Package);
        }
        if hint.starts_with('@') {
            return validate_package_name(hint).map(Subject::Package);
        }
        let path = strip_github_url(hint).unwrap_or(hint);
        if path.contains('/') {
            return path.trim_end_matches('/').parse().map(Subject::Repository);
        }
        validate_package_name(hint).map(Subject::Package)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Repository(r) => write!(f, "{r}"),
            Subject::Package(p) => write!(f, "npm:{p}"),
        }
    }
}

fn strip_github_url(s: &str) -> Option<&str> {
    let rest = s
        .strip_prefix("https://")
        .or_else(|| s.strip_prefix("http://"))
        .unwrap_or(s);
    let rest = rest.strip_prefix("www.").unwrap_or(rest);
    rest.strip_prefix("github.com/")
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:https?://)?(?:www\.)?github\.com/([A-Za-z0-9-]+/[A-Za-z0-9._-]+)")
            .expect("url regex")
    })
}

fn npm_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|\s)(?:npm:([@a-z0-9][a-z0-9._~/-]*)|(@[a-z0-9][a-z0-9._~-]*/[a-z0-9][a-z0-9._~-]*))")
            .expect("npm regex")
    })
}

fn prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z0-9][A-Za-z0-9-]*/[A-Za-z0-9._-]+)\s*:").expect("prefix regex")
    })
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[\s(`'\x22])([A-Za-z0-9][A-Za-z0-9-]*/[A-Za-z0-9._-]+)").expect("token regex")
    })
}

/// 从消息文本中提取显式主题：GitHub URL、开头的 `owner/repo:` 前缀、`npm:` 或 `@scope/name`
pub fn extract_subject(message: &str) -> Option<Subject> {
    if let Some(c) = url_re().captures(message) {
        if let Ok(r) = c[1].parse::<RepoPath>() {
            return Some(Subject::Repository(r));
        }
    }
    if let Some(c) = prefix_re().captures(message) {
        if let Ok(r) = c[1].parse::<RepoPath>() {
            return Some(Subject::Repository(r));
        }
    }
    if let Some(c) = npm_re().captures(message) {
        let raw = c.get(1).or_else(|| c.get(2)).map(|m| m.as_str()).unwrap_or_default();
        if let Ok(p) = validate_package_name(raw.trim_end_matches(['.', ',', '?', ':'])) {
            return Some(Subject::Package(p));
        }
    }
    None
}

/// 正文中的 `owner/repo` 片段只是候选主题（"and/or"、"I/O" 也长这样），
/// 只有用它的工具调用成功后才会成为当前主题
pub fn subject_candidate(message: &str) -> Option<Subject> {
    for c in token_re().captures_iter(message) {
        let m = c.get(1)?;
        // 紧跟 '/' 说明是文件路径而非仓库
        if message[m.end()..].starts_with('/') {
            continue;
        }
        let candidate = m.as_str().trim_end_matches(['.', ',', '?', ':', '!']);
        if let Ok(r) = candidate.parse::<RepoPath>() {
            return Some(Subject::Repository(r));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(s: &str) -> Subject {
        Subject::Repository(s.parse().unwrap())
    }

    #[test]
    fn test_repo_path_parse() {
        let r: RepoPath = "facebook/react".parse().unwrap();
        assert_eq!(r.owner, "facebook");
        assert_eq!(r.name, "react");
        assert_eq!("vercel/next.js".parse::<RepoPath>().unwrap().name, "next.js");
        assert!("not-a-valid-path".parse::<RepoPath>().is_err());
        assert!("a/b/c".parse::<RepoPath>().is_err());
        assert!("owner/..".parse::<RepoPath>().is_err());
        assert!("/react".parse::<RepoPath>().is_err());
    }

    #[test]
    fn test_extract_prefix_form() {
        assert_eq!(
            extract_subject("facebook/react: What are the top 5 contributors?"),
            Some(repo("facebook/react"))
        );
    }

    #[test]
    fn test_extract_url() {
        assert_eq!(
            extract_subject("look at https://github.com/rust-lang/rust/issues please"),
            Some(repo("rust-lang/rust"))
        );
    }

    #[test]
    fn test_inline_slash_words_are_only_candidates() {
        assert_eq!(extract_subject("How active is tokio-rs/tokio lately?"), None);
        assert_eq!(extract_subject("Summarize recent issues and/or PRs"), None);
        assert_eq!(extract_subject("Any I/O bugs?"), None);
        assert_eq!(
            subject_candidate("How active is tokio-rs/tokio lately?"),
            Some(repo("tokio-rs/tokio"))
        );
        assert_eq!(subject_candidate("check src/lib/mod.rs"), None);
    }

    #[test]
    fn test_extract_packages() {
        assert_eq!(
            extract_subject("downloads for npm:lodash?"),
            Some(Subject::Package("lodash".to_string()))
        );
        assert_eq!(
            extract_subject("what is @types/node used for"),
            Some(Subject::Package("@types/node".to_string()))
        );
    }

    #[test]
    fn test_extract_none() {
        assert_eq!(extract_subject("Summarize recent issues"), None);
        assert_eq!(extract_subject("check src/lib/mod.rs"), None);
    }

    #[test]
    fn test_parse_explicit() {
        assert_eq!(Subject::parse_explicit("facebook/react").unwrap(), repo("facebook/react"));
        assert_eq!(
            Subject::parse_explicit("https://github.com/facebook/react/").unwrap(),
            repo("facebook/react")
        );
        assert_eq!(
            Subject::parse_explicit("express").unwrap(),
            Subject::Package("express".to_string())
        );
        assert!(Subject::parse_explicit("Not A Package").is_err());
    }

    #[test]
    fn test_parse_as_kind() {
        assert!(Subject::parse_as(SubjectKind::Repository, "not-a-valid-path").is_err());
        assert_eq!(
            Subject::parse_as(SubjectKind::Package, "react").unwrap().kind(),
            SubjectKind::Package
        );
    }
}
