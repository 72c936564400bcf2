//! Agent self-information

use std::sync::Arc;

use async_trait::async_trait;

use super::{Capabilities, ExportContext, Exporter, KeyInfo, Plugin, PluginError, no_parameters};
use crate::{VERSION, Value};

pub struct AgentExporter {
    hostname: String,
}

#[async_trait]
impl Exporter for AgentExporter {
    async fn export(
        &self,
        key: &str,
        params: &[String],
        _context: &ExportContext,
    ) -> Result<Value, PluginError> {
        no_parameters(params)?;
        match key {
            "agent.ping" => Ok(Value::Unsigned(1)),
            "agent.version" => Ok(Value::Text(VERSION.to_string())),
            "agent.hostname" => Ok(Value::Text(self.hostname.clone())),
            _ => Err(PluginError::UnsupportedKey),
        }
    }
}

pub fn plugin(hostname: &str) -> Plugin {
    Plugin::new(
        "Agent",
        vec![
            KeyInfo::new("agent.ping", "Returns agent availability check result."),
            KeyInfo::new("agent.version", "Version of the agent."),
            KeyInfo::new("agent.hostname", "Returns hostname from the configuration."),
        ],
        Capabilities::Exporter(Arc::new(AgentExporter {
            hostname: hostname.to_string(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_agent_keys() {
        let exporter = AgentExporter {
            hostname: "web-01".to_string(),
        };
        let context = ExportContext::single_shot(Duration::from_secs(1));

        let ping = exporter.export("agent.ping", &[], &context).await.unwrap();
        assert_eq!(ping, Value::Unsigned(1));

        let host = exporter.export("agent.hostname", &[], &context).await.unwrap();
        assert_eq!(host, Value::Text("web-01".into()));

        let version = exporter.export("agent.version", &[], &context).await.unwrap();
        assert_eq!(version, Value::Text(VERSION.into()));

        assert!(
            exporter
                .export("agent.ping", &["x".to_string()], &context)
                .await
                .is_err()
        );
    }
}
