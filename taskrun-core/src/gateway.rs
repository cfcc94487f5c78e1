use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Routes module call frames to out-of-core services.
///
/// A module that *returns* an error is not a failure: the error comes back
/// as a JSON value (`{"error": ...}`) so the handler can observe and handle
/// it. Only a module that cannot be reached at all makes `call` return
/// `Err`, which fails the frame. No retries here; the first error surfaces.
#[async_trait]
pub trait ModuleGateway: Send + Sync {
    async fn call(&self, service: &str, method: &str, args: &[Value]) -> anyhow::Result<Value>;
}

/// HTTP gateway: POSTs `{service, method, args}` to the endpoint configured
/// for the service and maps `{result}` / `{error}` responses to values.
pub struct HttpModuleGateway {
    client: reqwest::Client,
    endpoints: HashMap<String, String>,
}

impl HttpModuleGateway {
    pub fn new(endpoints: HashMap<String, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }
}

#[async_trait]
impl ModuleGateway for HttpModuleGateway {
    async fn call(&self, service: &str, method: &str, args: &[Value]) -> anyhow::Result<Value> {
        let endpoint = self
            .endpoints
            .get(service)
            .ok_or_else(|| anyhow::anyhow!("no endpoint configured for module '{service}'"))?;

        let body = json!({
            "service": service,
            "method": method,
            "args": args,
        });
        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let payload: Value = response.json().await?;

        if let Some(error) = payload.get("error") {
            return Ok(json!({ "error": error }));
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Canned gateway for tests: answers from a `(service, method)` map, either
/// a result value or a module-declared error (still a value).
pub struct StaticGateway {
    responses: HashMap<(String, String), Value>,
}

impl StaticGateway {
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
        }
    }

    pub fn with_result(
        mut self,
        service: &str,
        method: &str,
        result: Value,
    ) -> Self {
        self.responses
            .insert((service.to_string(), method.to_string()), result);
        self
    }

    pub fn with_error(mut self, service: &str, method: &str, message: &str) -> Self {
        self.responses.insert(
            (service.to_string(), method.to_string()),
            json!({ "error": { "message": message } }),
        );
        self
    }
}

impl Default for StaticGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleGateway for StaticGateway {
    async fn call(&self, service: &str, method: &str, _args: &[Value]) -> anyhow::Result<Value> {
        self.responses
            .get(&(service.to_string(), method.to_string()))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("module endpoint unreachable: {service}/{method}"))
    }
}
