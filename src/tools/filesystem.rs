//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! ListFilesTool / ReadFileTool 基于 SafeFs 提供 list_files / read_file 能力。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::tools::schema::{decode_args, parameters_for};
use crate::tools::{Tool, ToolOutput};

/// read_file 默认最多返回的字符数
const DEFAULT_MAX_CHARS: usize = 20_000;
/// list_files 最多返回的条目数
const MAX_LIST_ENTRIES: usize = 500;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 检查路径是否在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let path = path.trim_start_matches("./");
        if path.is_empty() || path == "." {
            return Ok(self.root_dir.clone());
        }
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| format!("Path not found: {}", path))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(format!("Path escapes the workspace: {}", path)) // 如 ../../etc/passwd
        }
    }

    pub fn read_file(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved).map_err(|e| format!("Read failed: {}", e))
    }

    /// 列出目录下的文件（相对 root 的路径，排序，跳过隐藏项）；pattern 为 glob，按相对路径匹配
    pub fn list_files(
        &self,
        path: &str,
        pattern: Option<&str>,
        recursive: bool,
    ) -> Result<Vec<String>, String> {
        let base = self.resolve(path)?;
        if !base.is_dir() {
            return Err(format!("Not a directory: {}", path));
        }
        let matcher = pattern
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| format!("Invalid pattern: {}", e))?;
        let depth = if recursive { usize::MAX } else { 1 };
        let mut entries = Vec::new();
        let walker = WalkDir::new(&base)
            .min_depth(1)
            .max_depth(depth)
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.map_err(|e| format!("List failed: {}", e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root_dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if let Some(m) = &matcher {
                let name = entry.file_name().to_string_lossy();
                if !m.matches(&rel) && !m.matches(&name) {
                    continue;
                }
            }
            entries.push(rel);
        }
        entries.sort();
        entries.truncate(MAX_LIST_ENTRIES);
        Ok(entries)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListFilesArgs {
    /// 相对工作区的目录，默认 "."
    path: Option<String>,
    /// glob 过滤，如 "*.rs"
    pattern: Option<String>,
    /// 是否递归子目录，默认 false
    recursive: Option<bool>,
}

/// list_files 工具：返回文件路径 JSON 数组
pub struct ListFilesTool {
    fs: SafeFs,
}

impl ListFilesTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files in the workspace. Returns a JSON array of paths relative to the workspace root."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<ListFilesArgs>()
    }

    async fn call(&self, args: Value) -> Result<ToolOutput, String> {
        let args: ListFilesArgs = decode_args(args)?;
        let path = args.path.unwrap_or_else(|| ".".to_string());
        tracing::info!(path = %path, "list_files tool execute");
        let entries = self.fs.list_files(
            &path,
            args.pattern.as_deref(),
            args.recursive.unwrap_or(false),
        )?;
        Ok(ToolOutput::Json(Value::from(entries)))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadFileArgs {
    /// 相对工作区的文件路径
    path: String,
    /// 最多返回的字符数
    max_chars: Option<usize>,
}

/// read_file 工具：读取文件内容（超长截断）
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<ReadFileArgs>()
    }

    async fn call(&self, args: Value) -> Result<ToolOutput, String> {
        let args: ReadFileArgs = decode_args(args)?;
        tracing::info!(path = %args.path, "read_file tool execute");
        let content = self.fs.read_file(&args.path)?;
        let limit = args.max_chars.unwrap_or(DEFAULT_MAX_CHARS);
        if content.chars().count() > limit {
            let head: String = content.chars().take(limit).collect();
            Ok(ToolOutput::Text(format!("{head}\n...[truncated]")))
        } else {
            Ok(ToolOutput::Text(content))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.rs"), "fn main() {}").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("c.txt"), "gamma").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_list_files_flat_and_recursive() {
        let dir = workspace();
        let tool = ListFilesTool::new(dir.path());

        let flat = tool.call(serde_json::json!({})).await.unwrap();
        assert_eq!(flat, ToolOutput::Json(serde_json::json!(["a.txt", "b.rs"])));

        let deep = tool
            .call(serde_json::json!({"recursive": true, "pattern": "*.txt"}))
            .await
            .unwrap();
        assert_eq!(
            deep,
            ToolOutput::Json(serde_json::json!(["a.txt", "sub/c.txt"]))
        );
    }

    #[tokio::test]
    async fn test_read_file_and_escape() {
        let dir = workspace();
        let tool = ReadFileTool::new(dir.path());
        let out = tool.call(serde_json::json!({"path": "a.txt"})).await.unwrap();
        assert_eq!(out, ToolOutput::Text("alpha".to_string()));

        let truncated = tool
            .call(serde_json::json!({"path": "a.txt", "max_chars": 2}))
            .await
            .unwrap();
        assert!(truncated.into_text().starts_with("al\n"));

        assert!(tool
            .call(serde_json::json!({"path": "../../etc/passwd"}))
            .await
            .is_err());
    }
}
