//! 进程外设置存储
//!
//! 本核心只读写一个键：上一次 hosted thread 的 id（"继续上次对话"）。通过窄接口 get / set / delete 访问，
//! 在构造 Agent 时显式传入，而不是全局状态。文件实现整体解析、整体重写，写入走临时文件 + rename。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value};

use crate::core::AgentError;

/// "继续上次对话" 使用的固定键
pub const LAST_THREAD_ID_KEY: &str = "last_thread_id";

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, AgentError>;

    fn set(&self, key: &str, value: &str) -> Result<(), AgentError>;

    fn delete(&self, key: &str) -> Result<(), AgentError>;
}

/// 默认路径：<用户配置目录>/scout/settings.json
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("scout")
        .join("settings.json")
}

/// JSON 文件设置：保留文件中其它键，只改动目标键
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    // 同进程内串行化读改写
    lock: Mutex<()>,
}

impl JsonFileSettings {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Map<String, Value>, AgentError> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        if data.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&data) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(AgentError::Settings(format!(
                "{} is not a JSON object",
                self.path.display()
            ))),
            Err(e) => Err(AgentError::Settings(format!("{}: {e}", self.path.display()))),
        }
    }

    fn write(&self, map: &Map<String, Value>) -> Result<(), AgentError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(map)
            .map_err(|e| AgentError::Settings(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut Map<String, Value>)) -> Result<(), AgentError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| AgentError::Settings("settings lock poisoned".to_string()))?;
        let mut map = self.read()?;
        f(&mut map);
        self.write(&map)
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Result<Option<String>, AgentError> {
        Ok(self
            .read()?
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), AgentError> {
        self.update(|map| {
            map.insert(key.to_string(), Value::String(value.to_string()));
        })
    }

    fn delete(&self, key: &str) -> Result<(), AgentError> {
        self.update(|map| {
            map.remove(key);
        })
    }
}

/// 内存设置（测试与一次性运行）
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Result<Option<String>, AgentError> {
        Ok(self.values.lock().ok().and_then(|v| v.get(key).cloned()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), AgentError> {
        if let Ok(mut v) = self.values.lock() {
            v.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), AgentError> {
        if let Ok(mut v) = self.values.lock() {
            v.remove(key);
        }
        Ok(())
    }
}
