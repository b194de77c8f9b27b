//! Provider-hosted tools - web and file search
//!
//! These are declared to the provider and executed on its side. The client
//! only observes the calls and never answers them.

use async_trait::async_trait;
use serde_json::{json, Value};
use crate::Result;
use crate::error::Error;
use super::{Capability, Tool};

fn not_local(name: &str) -> Error {
    Error::Tool(format!("{} is executed by the provider", name))
}

/// Hosted web search
pub struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str { "web_search" }
    fn description(&self) -> &str { "Search the web (executed by the provider)" }
    fn parameters(&self) -> Value { json!({"type": "object"}) }
    fn capability(&self) -> Capability { Capability::ServerExecuted }

    fn hosted_definition(&self) -> Option<Value> {
        Some(json!({"type": "web_search"}))
    }

    async fn execute(&self, _params: Value) -> Result<String> {
        Err(not_local(self.name()))
    }
}

/// Hosted search over attached vector stores
pub struct FileSearchTool {
    vector_store_ids: Vec<String>,
}

impl FileSearchTool {
    pub fn new(vector_store_ids: Vec<String>) -> Self {
        Self { vector_store_ids }
    }
}

#[async_trait]
impl Tool for FileSearchTool {
    fn name(&self) -> &str { "file_search" }
    fn description(&self) -> &str { "Search attached documentation (executed by the provider)" }
    fn parameters(&self) -> Value { json!({"type": "object"}) }
    fn capability(&self) -> Capability { Capability::ServerExecuted }

    fn hosted_definition(&self) -> Option<Value> {
        Some(json!({
            "type": "file_search",
            "vector_store_ids": self.vector_store_ids,
            "max_num_results": 20
        }))
    }

    async fn execute(&self, _params: Value) -> Result<String> {
        Err(not_local(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_search_definition() {
        let tool = FileSearchTool::new(vec!["vs_1".to_string()]);
        let definition = tool.to_definition();
        let hosted = definition.hosted.unwrap();
        assert_eq!(hosted["type"], "file_search");
        assert_eq!(hosted["vector_store_ids"][0], "vs_1");
        assert_eq!(hosted["max_num_results"], 20);
    }

    #[tokio::test]
    async fn test_hosted_tools_refuse_local_execution() {
        assert!(WebSearchTool.execute(json!({})).await.is_err());
        assert_eq!(WebSearchTool.capability(), Capability::ServerExecuted);
    }
}
