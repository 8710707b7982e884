//! Capability contract - the unit of executable behavior behind the runtime.
//!
//! A capability declares:
//! - Who it is (dotted name, semver version, category, tags)
//! - How it may be called (auth, rate limit, allowed caller classes)
//! - What input it accepts (a typed `Input` with a generated JSON schema)
//! - What it does (`execute`), plus optional secondary validation and
//!   load/unload hooks
//!
//! Implementers write against the typed [`Capability`] trait. The registry
//! and executor only see the erased [`DynCapability`] form, produced with
//! [`into_dyn`] or supplied directly by a [`FnCapability`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{CapabilityError, ValidationError};
use super::tool_descriptor::ToolDescriptor;

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]+(\.[A-Za-z0-9_\-]+)+$").unwrap());
static VERSION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+(-[0-9A-Za-z.\-]+)?(\+[0-9A-Za-z.\-]+)?$").unwrap()
});

// ---------------------------------------------------------------------------
// Category / CallerClass
// ---------------------------------------------------------------------------

/// Grouping category. Exactly one per capability, used for listing order only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Immigration,
    Tax,
    Documents,
    Communication,
    Scheduling,
    Knowledge,
    Admin,
    Utility,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Immigration,
        Category::Tax,
        Category::Documents,
        Category::Communication,
        Category::Scheduling,
        Category::Knowledge,
        Category::Admin,
        Category::Utility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immigration => "immigration",
            Self::Tax => "tax",
            Self::Documents => "documents",
            Self::Communication => "communication",
            Self::Scheduling => "scheduling",
            Self::Knowledge => "knowledge",
            Self::Admin => "admin",
            Self::Utility => "utility",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown category: {}", s))
    }
}

/// Class of caller a capability may be exposed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallerClass {
    /// The AI assistant's tool-calling loop.
    Assistant,
    /// Public HTTP handlers.
    Http,
    /// Operator command line.
    Cli,
    /// Administrative dashboard.
    Admin,
    /// Other capabilities and background jobs.
    Internal,
}

impl CallerClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::Http => "http",
            Self::Cli => "cli",
            Self::Admin => "admin",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for CallerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallerClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "assistant" => Ok(Self::Assistant),
            "http" => Ok(Self::Http),
            "cli" => Ok(Self::Cli),
            "admin" => Ok(Self::Admin),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown caller class: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// CapabilityDescriptor
// ---------------------------------------------------------------------------

/// Static metadata of a capability.
///
/// Example (JSON form, as returned by the admin surface):
/// ```json
/// {
///   "name": "immigration.visa_requirements",
///   "version": "1.2.0",
///   "description": "Look up visa requirements for a nationality/destination pair",
///   "category": "immigration",
///   "tags": ["visa", "travel"],
///   "requires_auth": false,
///   "estimated_time_seconds": 3.0,
///   "rate_limit_per_minute": 30,
///   "allowed_callers": ["assistant", "http"],
///   "legacy_alias": "visa_lookup"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityDescriptor {
    /// Unique dotted name (e.g. "tax.deadline_calculator")
    pub name: String,

    /// Semantic version
    pub version: String,

    /// Human-readable description, also exported to tool descriptors
    pub description: String,

    /// Grouping category
    pub category: Category,

    /// Searchable tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Caller must be identified (`caller_id`) to invoke
    #[serde(default)]
    pub requires_auth: bool,

    /// Advisory: capability is intended for administrators
    #[serde(default)]
    pub requires_admin: bool,

    /// Advisory: names of other capabilities this one calls
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Expected run time; the default timeout is twice this value
    #[serde(default = "default_estimated_time")]
    pub estimated_time_seconds: f64,

    /// Sliding-window limit per caller, per minute
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,

    /// Caller classes the capability is exposed to. Empty means all.
    #[serde(default)]
    pub allowed_callers: Vec<CallerClass>,

    /// Former name still accepted by lookups
    #[serde(default)]
    pub legacy_alias: Option<String>,
}

fn default_estimated_time() -> f64 {
    5.0
}

impl CapabilityDescriptor {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        category: Category,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            category,
            tags: Vec::new(),
            requires_auth: false,
            requires_admin: false,
            dependencies: Vec::new(),
            estimated_time_seconds: default_estimated_time(),
            rate_limit_per_minute: None,
            allowed_callers: Vec::new(),
            legacy_alias: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into();
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
        self
    }

    pub fn with_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    pub fn with_admin(mut self, requires_admin: bool) -> Self {
        self.requires_admin = requires_admin;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_estimated_time(mut self, seconds: f64) -> Self {
        self.estimated_time_seconds = seconds;
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = Some(per_minute);
        self
    }

    pub fn with_allowed_callers(mut self, callers: impl IntoIterator<Item = CallerClass>) -> Self {
        self.allowed_callers = callers.into_iter().collect();
        self
    }

    pub fn with_legacy_alias(mut self, alias: impl Into<String>) -> Self {
        self.legacy_alias = Some(alias.into());
        self
    }

    /// Structural checks performed at registration.
    pub fn validate(&self) -> Result<(), String> {
        if !NAME_PATTERN.is_match(&self.name) {
            return Err(format!(
                "name '{}' must be dotted segments of [A-Za-z0-9_-]",
                self.name
            ));
        }
        if !VERSION_PATTERN.is_match(&self.version) {
            return Err(format!("version '{}' is not MAJOR.MINOR.PATCH", self.version));
        }
        if !self.estimated_time_seconds.is_finite() || self.estimated_time_seconds < 0.0 {
            return Err("estimated_time_seconds must be a non-negative number".to_string());
        }
        if self.rate_limit_per_minute == Some(0) {
            return Err("rate_limit_per_minute must be at least 1".to_string());
        }
        if let Some(alias) = &self.legacy_alias {
            if alias.trim().is_empty() || alias == &self.name {
                return Err(format!("legacy alias '{}' is not usable", alias));
            }
        }
        Ok(())
    }

    /// Timeout derived from the time estimate. `None` when the estimate is
    /// zero or twice the estimate does not fit in a `Duration`.
    pub fn default_timeout(&self) -> Option<Duration> {
        if self.estimated_time_seconds > 0.0 {
            Duration::try_from_secs_f64(self.estimated_time_seconds * 2.0).ok()
        } else {
            None
        }
    }

    pub fn allows_caller(&self, caller: CallerClass) -> bool {
        self.allowed_callers.is_empty() || self.allowed_callers.contains(&caller)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Per-invocation context handed to `execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionContext {
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    /// Caller-supplied values (locale, conversation id, client tier, ...)
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

// ---------------------------------------------------------------------------
// ValidatedInput
// ---------------------------------------------------------------------------

/// Input that passed a capability's schema, in that capability's typed form.
///
/// Cheap to clone; every retry attempt shares the same parsed value.
#[derive(Clone)]
pub struct ValidatedInput {
    value: Arc<dyn Any + Send + Sync>,
}

impl ValidatedInput {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for ValidatedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValidatedInput(..)")
    }
}

// ---------------------------------------------------------------------------
// Capability (typed) / DynCapability (erased)
// ---------------------------------------------------------------------------

/// A capability with strongly typed input and output.
///
/// # Example
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct DeadlineInput { tax_year: u16, extension: bool }
///
/// struct FilingDeadline { descriptor: CapabilityDescriptor }
///
/// #[async_trait]
/// impl Capability for FilingDeadline {
///     type Input = DeadlineInput;
///     type Output = Value;
///     fn descriptor(&self) -> &CapabilityDescriptor { &self.descriptor }
///     async fn execute(&self, input: &DeadlineInput, _ctx: &ExecutionContext)
///         -> Result<Value, CapabilityError>
///     {
///         let month = if input.extension { 10 } else { 4 };
///         Ok(json!({ "deadline": format!("{}-{:02}-15", input.tax_year + 1, month) }))
///     }
/// }
/// ```
#[async_trait]
pub trait Capability: Send + Sync + 'static {
    /// Parsed input. Deserializing raw JSON into it is the input validator.
    type Input: DeserializeOwned + JsonSchema + Send + Sync + 'static;

    /// Result value, serialized to JSON by the runtime.
    type Output: Serialize + Send + 'static;

    fn descriptor(&self) -> &CapabilityDescriptor;

    /// Secondary gate run before every attempt. Rejections are not retried.
    fn validate(&self, _input: &Self::Input) -> bool {
        true
    }

    async fn execute(
        &self,
        input: &Self::Input,
        ctx: &ExecutionContext,
    ) -> Result<Self::Output, CapabilityError>;

    async fn on_load(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn on_unload(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}

/// Object-safe capability contract used by the registry and executor.
#[async_trait]
pub trait DynCapability: Send + Sync {
    fn descriptor(&self) -> &CapabilityDescriptor;

    /// JSON schema of the accepted input.
    fn input_schema(&self) -> Value;

    /// Parse raw JSON input. Never panics.
    fn validate_input(&self, raw: &Value) -> Result<ValidatedInput, ValidationError>;

    fn validate(&self, input: &ValidatedInput) -> bool;

    async fn execute(
        &self,
        input: &ValidatedInput,
        ctx: &ExecutionContext,
    ) -> Result<Value, CapabilityError>;

    async fn on_load(&self) -> Result<(), CapabilityError>;

    async fn on_unload(&self) -> Result<(), CapabilityError>;

    /// Projection into the function-calling shape of an LLM provider.
    fn to_tool_descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::from_capability(self.descriptor(), self.input_schema())
    }
}

/// Erase a typed capability for registration.
pub fn into_dyn<C: Capability>(capability: C) -> Arc<dyn DynCapability> {
    Arc::new(TypedCapability(capability))
}

/// Adapter from [`Capability`] to [`DynCapability`].
struct TypedCapability<C>(C);

#[async_trait]
impl<C: Capability> DynCapability for TypedCapability<C> {
    fn descriptor(&self) -> &CapabilityDescriptor {
        self.0.descriptor()
    }

    fn input_schema(&self) -> Value {
        let root = schemars::gen::SchemaGenerator::default().into_root_schema_for::<C::Input>();
        let mut schema = serde_json::to_value(root)
            .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}));
        if let Some(obj) = schema.as_object_mut() {
            obj.remove("$schema");
        }
        schema
    }

    fn validate_input(&self, raw: &Value) -> Result<ValidatedInput, ValidationError> {
        serde_json::from_value::<C::Input>(raw.clone())
            .map(ValidatedInput::new)
            .map_err(|e| ValidationError::new(e.to_string()))
    }

    fn validate(&self, input: &ValidatedInput) -> bool {
        match input.downcast_ref::<C::Input>() {
            Some(typed) => self.0.validate(typed),
            None => false,
        }
    }

    async fn execute(
        &self,
        input: &ValidatedInput,
        ctx: &ExecutionContext,
    ) -> Result<Value, CapabilityError> {
        let typed = input.downcast_ref::<C::Input>().ok_or_else(|| {
            CapabilityError::InvalidInput(format!(
                "input was not validated by '{}'",
                self.0.descriptor().name
            ))
        })?;
        let output = self.0.execute(typed, ctx).await?;
        serde_json::to_value(output)
            .map_err(|e| CapabilityError::Failed(format!("output serialization failed: {}", e)))
    }

    async fn on_load(&self) -> Result<(), CapabilityError> {
        self.0.on_load().await
    }

    async fn on_unload(&self) -> Result<(), CapabilityError> {
        self.0.on_unload().await
    }
}

// ---------------------------------------------------------------------------
// FnCapability
// ---------------------------------------------------------------------------

type Handler = Arc<
    dyn Fn(Value, ExecutionContext) -> BoxFuture<'static, Result<Value, CapabilityError>>
        + Send
        + Sync,
>;
type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Capability backed by an async closure over raw JSON.
///
/// The input schema is checked shallowly: the top-level `type` must be
/// `object` if declared, and every `required` property must be present.
#[derive(Clone)]
pub struct FnCapability {
    descriptor: CapabilityDescriptor,
    input_schema: Value,
    handler: Handler,
    validator: Option<Predicate>,
}

impl FnCapability {
    pub fn new<F, Fut>(descriptor: CapabilityDescriptor, handler: F) -> Self
    where
        F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CapabilityError>> + Send + 'static,
    {
        Self {
            descriptor,
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
            handler: Arc::new(move |input, ctx| Box::pin(handler(input, ctx))),
            validator: None,
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Secondary validation predicate.
    pub fn with_validator<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(predicate));
        self
    }

    pub fn into_dyn(self) -> Arc<dyn DynCapability> {
        Arc::new(self)
    }
}

impl fmt::Debug for FnCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCapability")
            .field("name", &self.descriptor.name)
            .field("version", &self.descriptor.version)
            .finish()
    }
}

#[async_trait]
impl DynCapability for FnCapability {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    fn validate_input(&self, raw: &Value) -> Result<ValidatedInput, ValidationError> {
        let schema = &self.input_schema;
        if schema.get("type").and_then(Value::as_str) == Some("object") && !raw.is_object() {
            return Err(ValidationError::new(format!(
                "expected an object, got {}",
                json_type_name(raw)
            )));
        }
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            let missing: Vec<&str> = required
                .iter()
                .filter_map(Value::as_str)
                .filter(|field| raw.get(*field).is_none())
                .collect();
            if !missing.is_empty() {
                return Err(ValidationError::new(format!(
                    "missing required field(s): {}",
                    missing.join(", ")
                )));
            }
        }
        Ok(ValidatedInput::new(raw.clone()))
    }

    fn validate(&self, input: &ValidatedInput) -> bool {
        match (&self.validator, input.downcast_ref::<Value>()) {
            (Some(predicate), Some(value)) => predicate(value),
            (None, Some(_)) => true,
            (_, None) => false,
        }
    }

    async fn execute(
        &self,
        input: &ValidatedInput,
        ctx: &ExecutionContext,
    ) -> Result<Value, CapabilityError> {
        let value = input.downcast_ref::<Value>().cloned().ok_or_else(|| {
            CapabilityError::InvalidInput(format!(
                "input was not validated by '{}'",
                self.descriptor.name
            ))
        })?;
        (self.handler)(value, ctx.clone()).await
    }

    async fn on_load(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn on_unload(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct DeadlineInput {
        tax_year: u16,
        #[serde(default)]
        extension: bool,
    }

    struct FilingDeadline {
        descriptor: CapabilityDescriptor,
    }

    #[async_trait]
    impl Capability for FilingDeadline {
        type Input = DeadlineInput;
        type Output = Value;

        fn descriptor(&self) -> &CapabilityDescriptor {
            &self.descriptor
        }

        fn validate(&self, input: &DeadlineInput) -> bool {
            input.tax_year >= 2000
        }

        async fn execute(
            &self,
            input: &DeadlineInput,
            _ctx: &ExecutionContext,
        ) -> Result<Value, CapabilityError> {
            let month = if input.extension { 10 } else { 4 };
            Ok(json!({ "deadline": format!("{}-{:02}-15", input.tax_year + 1, month) }))
        }
    }

    fn deadline() -> Arc<dyn DynCapability> {
        into_dyn(FilingDeadline {
            descriptor: CapabilityDescriptor::new(
                "tax.filing_deadline",
                "1.0.0",
                "Compute the federal filing deadline",
                Category::Tax,
            ),
        })
    }

    #[test]
    fn test_descriptor_validation() {
        let ok = CapabilityDescriptor::new("echo.v1", "1.0.0", "Echo", Category::Utility);
        assert!(ok.validate().is_ok());

        let undotted = CapabilityDescriptor::new("echo", "1.0.0", "Echo", Category::Utility);
        assert!(undotted.validate().is_err());

        let bad_version = CapabilityDescriptor::new("echo.v1", "1.0", "Echo", Category::Utility);
        assert!(bad_version.validate().is_err());

        let prerelease =
            CapabilityDescriptor::new("echo.v1", "2.0.0-beta.1", "Echo", Category::Utility);
        assert!(prerelease.validate().is_ok());

        let zero_limit = ok.clone().with_rate_limit(0);
        assert!(zero_limit.validate().is_err());

        let nan_time = ok.clone().with_estimated_time(f64::NAN);
        assert!(nan_time.validate().is_err());

        let self_alias = ok.with_legacy_alias("echo.v1");
        assert!(self_alias.validate().is_err());
    }

    #[test]
    fn test_default_timeout_is_twice_estimate() {
        let d = CapabilityDescriptor::new("docs.ocr", "1.0.0", "OCR", Category::Documents)
            .with_estimated_time(1.5);
        assert_eq!(d.default_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(d.clone().with_estimated_time(0.0).default_timeout(), None);

        let huge = d.with_estimated_time(1e19);
        assert!(huge.validate().is_ok());
        assert_eq!(huge.default_timeout(), None);
    }

    #[test]
    fn test_tags_are_deduplicated() {
        let d = CapabilityDescriptor::new("tax.vat", "1.0.0", "VAT", Category::Tax)
            .with_tags(["vat", "eu", "vat"]);
        assert_eq!(d.tags, vec!["vat", "eu"]);
        assert!(d.has_tag("EU"));
    }

    #[test]
    fn test_allowed_callers_empty_means_all() {
        let d = CapabilityDescriptor::new("tax.vat", "1.0.0", "VAT", Category::Tax);
        assert!(d.allows_caller(CallerClass::Cli));
        let d = d.with_allowed_callers([CallerClass::Admin]);
        assert!(d.allows_caller(CallerClass::Admin));
        assert!(!d.allows_caller(CallerClass::Assistant));
    }

    #[test]
    fn test_category_round_trip_through_str() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
        }
        assert!("visa".parse::<Category>().is_err());
        assert_eq!(
            serde_json::to_value(Category::Immigration).unwrap(),
            json!("immigration")
        );
    }

    #[test]
    fn test_descriptor_deserializes_with_defaults() {
        let d: CapabilityDescriptor = serde_json::from_value(json!({
            "name": "immigration.visa_requirements",
            "version": "1.2.0",
            "description": "Visa lookup",
            "category": "immigration",
            "allowed_callers": ["assistant", "http"]
        }))
        .unwrap();
        assert_eq!(d.estimated_time_seconds, 5.0);
        assert!(d.tags.is_empty());
        assert!(d.allows_caller(CallerClass::Http));
        assert!(!d.allows_caller(CallerClass::Cli));
    }

    #[tokio::test]
    async fn test_typed_capability_validates_and_executes() {
        let cap = deadline();

        let err = cap.validate_input(&json!({"tax_year": "soon"})).unwrap_err();
        assert!(err.message.contains("invalid type"));

        let input = cap.validate_input(&json!({"tax_year": 2024, "extension": true})).unwrap();
        assert!(cap.validate(&input));
        let out = cap.execute(&input, &ExecutionContext::new()).await.unwrap();
        assert_eq!(out, json!({"deadline": "2025-10-15"}));

        let old = cap.validate_input(&json!({"tax_year": 1999})).unwrap();
        assert!(!cap.validate(&old));
    }

    #[tokio::test]
    async fn test_typed_capability_rejects_foreign_input() {
        let cap = deadline();
        let foreign = ValidatedInput::new(json!({"tax_year": 2024}));
        assert!(!cap.validate(&foreign));
        let err = cap.execute(&foreign, &ExecutionContext::new()).await.unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidInput(_)));
    }

    #[test]
    fn test_typed_input_schema_has_properties() {
        let schema = deadline().input_schema();
        assert!(schema.get("$schema").is_none());
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["tax_year"].is_object());
        assert_eq!(schema["required"], json!(["tax_year"]));
    }

    #[tokio::test]
    async fn test_fn_capability_checks_required_fields() {
        let cap = FnCapability::new(
            CapabilityDescriptor::new("comms.send_sms", "1.0.0", "SMS", Category::Communication),
            |input, ctx| async move {
                Ok(json!({"to": input["to"], "caller": ctx.caller_id}))
            },
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {"to": {"type": "string"}, "body": {"type": "string"}},
            "required": ["to", "body"]
        }))
        .with_validator(|v| v["body"].as_str().map_or(false, |b| b.len() <= 160))
        .into_dyn();

        let err = cap.validate_input(&json!({"to": "+1555"})).unwrap_err();
        assert_eq!(err.message, "missing required field(s): body");
        assert!(cap.validate_input(&json!("hello")).is_err());

        let long = cap
            .validate_input(&json!({"to": "+1555", "body": "x".repeat(200)}))
            .unwrap();
        assert!(!cap.validate(&long));

        let input = cap.validate_input(&json!({"to": "+1555", "body": "hi"})).unwrap();
        let ctx = ExecutionContext::new().with_caller("client-7");
        let out = cap.execute(&input, &ctx).await.unwrap();
        assert_eq!(out, json!({"to": "+1555", "caller": "client-7"}));
    }

    #[test]
    fn test_execution_context_builders() {
        let ctx = ExecutionContext::new()
            .with_caller("u-1")
            .with_request_id("r-1")
            .with_data("locale", json!("de-DE"));
        assert_eq!(ctx.caller_id.as_deref(), Some("u-1"));
        assert_eq!(ctx.request_id.as_deref(), Some("r-1"));
        assert_eq!(ctx.get("locale"), Some(&json!("de-DE")));
    }
}
