//! 工具参数 JSON Schema 生成（schemars）
//!
//! 每个工具用带 `JsonSchema` 的参数结构体描述契约，这里把 schemars 的 RootSchema 整理成
//! function calling 需要的 `{"type":"object","properties":...,"required":[...]}`。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// 参数结构体 -> function calling 参数 schema（去掉 $schema / title，并保证有 required 数组）
pub fn parameters_for<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
        obj.entry("type").or_insert_with(|| Value::String("object".into()));
        obj.entry("properties")
            .or_insert_with(|| Value::Object(Default::default()));
        obj.entry("required").or_insert_with(|| Value::Array(Vec::new()));
    }
    value
}

/// 工具内部的类型化解码
pub fn decode_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))
}
