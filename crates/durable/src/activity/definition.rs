//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Error type reported by `UnknownHandler` activity calls
pub const UNKNOWN_HANDLER_ERROR: &str = "UnknownHandler";

/// Error type reported when an activity handler panics
pub const PANIC_ERROR: &str = "Panic";

/// Error type reported when activity input or output fails to (de)serialize
pub const SERIALIZATION_ERROR: &str = "Serialization";

/// Error type for activity failures
///
/// The message is persisted verbatim on the activity execution row and is
/// what the calling workflow sees when it inspects the error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether a retry combinator may attempt the call again
    ///
    /// The engine itself never retries; this only informs
    /// `WorkflowContext::call_activity_with_retry`.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Error raised into a workflow body that called an unregistered activity
    pub fn unknown_handler(activity_name: &str) -> Self {
        Self::non_retryable(format!("unknown activity: {activity_name}"))
            .with_type(UNKNOWN_HANDLER_ERROR)
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether this error came from calling an unregistered activity
    pub fn is_unknown_handler(&self) -> bool {
        self.error_type.as_deref() == Some(UNKNOWN_HANDLER_ERROR)
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        Self::non_retryable(err.to_string()).with_type(SERIALIZATION_ERROR)
    }
}

/// An activity is a single unit of work called by a workflow
///
/// Activities run inline on the worker that runs their workflow. Input and
/// output cross a durable boundary, so both must serialize to plain JSON
/// (numbers, strings, booleans, null, arrays and objects of those).
///
/// # Example
///
/// ```ignore
/// use tallyloom_durable::prelude::*;
///
/// struct SendEmailActivity;
///
/// #[async_trait]
/// impl Activity for SendEmailActivity {
///     const TYPE: &'static str = "send_email";
///     type Input = SendEmailInput;
///     type Output = SendEmailOutput;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         // Send email...
///         Ok(SendEmailOutput { message_id: "..." })
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Name under which the activity is registered
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// # Errors
    ///
    /// Any error is recorded on the activity execution row and raised into
    /// the calling workflow body.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
