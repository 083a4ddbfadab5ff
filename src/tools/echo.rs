//! Echo 工具（测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::{decode_args, parameters_for};
use crate::tools::{Tool, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoArgs {
    /// 要回显的文本
    text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing)."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<EchoArgs>()
    }

    async fn call(&self, args: Value) -> Result<ToolOutput, String> {
        let args: EchoArgs = decode_args(args)?;
        Ok(ToolOutput::Text(args.text))
    }
}
