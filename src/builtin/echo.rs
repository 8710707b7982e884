//! `echo.v1` - returns its input together with the caller and request ids.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::capabilities::{
    CallerClass, Capability, CapabilityDescriptor, CapabilityError, Category, ExecutionContext,
};

pub struct EchoCapability {
    descriptor: CapabilityDescriptor,
}

impl EchoCapability {
    pub fn new() -> Self {
        Self {
            descriptor: CapabilityDescriptor::new(
                "echo.v1",
                "1.0.0",
                "Echo the input object back, with caller and request ids",
                Category::Utility,
            )
            .with_tags(["diagnostic", "echo"])
            .with_estimated_time(0.1)
            .with_allowed_callers([
                CallerClass::Assistant,
                CallerClass::Http,
                CallerClass::Cli,
                CallerClass::Admin,
                CallerClass::Internal,
            ])
            .with_legacy_alias("echo"),
        }
    }
}

impl Default for EchoCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for EchoCapability {
    type Input = Map<String, Value>;
    type Output = Value;

    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        input: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value, CapabilityError> {
        Ok(json!({
            "echo": input,
            "caller_id": ctx.caller_id,
            "request_id": ctx.request_id,
        }))
    }
}
