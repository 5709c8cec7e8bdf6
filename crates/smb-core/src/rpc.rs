//! Interface-shaped remote procedure calls.
//!
//! An [`InterfaceContract`] names an interface and lists its method
//! signatures. The calling side obtains a [`Proxy`] whose invocations become
//! synchronous calls under the interface's qualified name, carrying
//! `[method, [args...]]`. The serving side binds an
//! [`InterfaceImplementation`] under the same name; the bound handler picks
//! the first declared signature whose name, arity, and argument shapes match
//! the request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::envelope::Envelope;
use crate::errors::{CallError, RegistrationError};
use crate::failure::HandlerFailure;
use crate::registry::SynchronousHandler;
use crate::router::Router;

/// JSON shape accepted by a parameter or produced by a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueShape {
    /// Any value, including `null`.
    Any,
    /// Only `null`.
    Null,
    /// A boolean.
    Bool,
    /// An integral number.
    Integer,
    /// Any number, integral or not.
    Number,
    /// A string.
    String,
    /// An array.
    Array,
    /// An object.
    Object,
}

impl ValueShape {
    /// Whether `value` can be passed where this shape is expected.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Null => value.is_null(),
            Self::Bool => value.is_boolean(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::String => value.is_string(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for ValueShape {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One declared method of an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSignature {
    name: String,
    params: Vec<ValueShape>,
    returns: ValueShape,
}

impl MethodSignature {
    /// Declares a method.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        params: impl IntoIterator<Item = ValueShape>,
        returns: ValueShape,
    ) -> Self {
        Self {
            name: name.into(),
            params: params.into_iter().collect(),
            returns,
        }
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter shapes in declaration order.
    #[must_use]
    pub fn params(&self) -> &[ValueShape] {
        &self.params
    }

    /// Declared result shape.
    #[must_use]
    pub const fn returns(&self) -> ValueShape {
        self.returns
    }

    /// Whether `args` match this signature's arity and parameter shapes.
    #[must_use]
    pub fn accepts(&self, args: &[Value]) -> bool {
        self.params.len() == args.len()
            && self
                .params
                .iter()
                .zip(args)
                .all(|(shape, value)| shape.accepts(value))
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}(", self.name)?;
        for (index, shape) in self.params.iter().enumerate() {
            if index > 0 {
                formatter.write_str(", ")?;
            }
            write!(formatter, "{shape}")?;
        }
        write!(formatter, ") -> {}", self.returns)
    }
}

/// Named set of method signatures shared by both ends of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceContract {
    qualified_name: String,
    methods: Vec<MethodSignature>,
}

impl InterfaceContract {
    /// Starts declaring an interface.
    #[must_use]
    pub fn builder(qualified_name: impl Into<String>) -> InterfaceContractBuilder {
        InterfaceContractBuilder {
            qualified_name: qualified_name.into(),
            methods: Vec::new(),
        }
    }

    /// Fully qualified interface name, used as the message type.
    #[must_use]
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Declared methods in declaration order.
    #[must_use]
    pub fn methods(&self) -> &[MethodSignature] {
        &self.methods
    }

    /// Whether any overload of `method` is declared.
    #[must_use]
    pub fn declares(&self, method: &str) -> bool {
        self.methods.iter().any(|signature| signature.name == method)
    }

    /// First declared signature matching `method` and `args`.
    #[must_use]
    pub fn resolve(&self, method: &str, args: &[Value]) -> Option<&MethodSignature> {
        self.methods
            .iter()
            .filter(|signature| signature.name == method)
            .find(|signature| signature.accepts(args))
    }
}

/// Builder for [`InterfaceContract`].
#[derive(Debug, Clone)]
pub struct InterfaceContractBuilder {
    qualified_name: String,
    methods: Vec<MethodSignature>,
}

impl InterfaceContractBuilder {
    /// Declares a method; overloads are matched in declaration order.
    #[must_use]
    pub fn method(
        mut self,
        name: impl Into<String>,
        params: impl IntoIterator<Item = ValueShape>,
        returns: ValueShape,
    ) -> Self {
        self.methods.push(MethodSignature::new(name, params, returns));
        self
    }

    /// Finishes the contract.
    #[must_use]
    pub fn build(self) -> InterfaceContract {
        InterfaceContract {
            qualified_name: self.qualified_name,
            methods: self.methods,
        }
    }
}

/// Serving-side implementation of an interface.
pub trait InterfaceImplementation: Send + Sync {
    /// Runs the resolved method with decoded arguments.
    ///
    /// # Errors
    ///
    /// Returned failures travel back to the caller as a remote failure.
    fn invoke(&self, method: &MethodSignature, args: Vec<Value>) -> Result<Value, HandlerFailure>;
}

impl<F> InterfaceImplementation for F
where
    F: Fn(&MethodSignature, Vec<Value>) -> Result<Value, HandlerFailure> + Send + Sync,
{
    fn invoke(&self, method: &MethodSignature, args: Vec<Value>) -> Result<Value, HandlerFailure> {
        self(method, args)
    }
}

/// Failures raised on the serving side before an implementation runs.
#[derive(Debug, Error)]
pub enum RpcDispatchError {
    /// No declared signature matches the request.
    #[error("interface {interface} has no method matching {method} with {arity} argument(s)")]
    NoMatchingMethod {
        /// Qualified interface name.
        interface: String,
        /// Requested method name.
        method: String,
        /// Number of arguments supplied.
        arity: usize,
    },
    /// The request payload is not `[method, args]`.
    #[error("malformed invocation for {interface}: {detail}")]
    MalformedInvocation {
        /// Qualified interface name.
        interface: String,
        /// What was wrong with the payload.
        detail: String,
    },
}

fn encode_invocation(method: &str, args: Vec<Value>) -> Value {
    json!([method, args])
}

fn decode_invocation(
    interface: &str,
    content: &Value,
) -> Result<(String, Vec<Value>), RpcDispatchError> {
    let malformed = |detail: &str| RpcDispatchError::MalformedInvocation {
        interface: interface.to_owned(),
        detail: detail.to_owned(),
    };
    let Some([method_value, args_value]) = content.as_array().map(Vec::as_slice) else {
        return Err(malformed("expected a two-element array"));
    };
    let Some(method) = method_value.as_str() else {
        return Err(malformed("method name must be a string"));
    };
    let args = match args_value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.clone(),
        _ => return Err(malformed("arguments must be an array or null")),
    };
    Ok((method.to_owned(), args))
}

/// Synchronous handler dispatching requests onto an implementation.
pub struct InterfaceHandler {
    contract: Arc<InterfaceContract>,
    implementation: Arc<dyn InterfaceImplementation>,
}

impl InterfaceHandler {
    /// Pairs a contract with its implementation.
    #[must_use]
    pub const fn new(
        contract: Arc<InterfaceContract>,
        implementation: Arc<dyn InterfaceImplementation>,
    ) -> Self {
        Self {
            contract,
            implementation,
        }
    }
}

impl SynchronousHandler for InterfaceHandler {
    fn on_request(&self, envelope: &Envelope) -> Result<Value, HandlerFailure> {
        let interface = self.contract.qualified_name();
        let (method, args) = decode_invocation(interface, envelope.content())?;
        let signature = self.contract.resolve(&method, &args).ok_or_else(|| {
            RpcDispatchError::NoMatchingMethod {
                interface: interface.to_owned(),
                method: method.clone(),
                arity: args.len(),
            }
        })?;
        self.implementation.invoke(signature, args)
    }
}

/// Calling-side stub for one interface on one connection.
#[derive(Debug, Clone)]
pub struct Proxy {
    router: Router,
    contract: Arc<InterfaceContract>,
    timeout: Duration,
}

impl Proxy {
    /// Contract the proxy speaks.
    #[must_use]
    pub fn contract(&self) -> &InterfaceContract {
        &self.contract
    }

    /// Timeout applied to every invocation.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invokes `method` on the remote implementation.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::UnknownMethod`] without touching the connection
    /// when the contract declares no such method, and otherwise any error
    /// from [`Router::call`].
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        if !self.contract.declares(method) {
            return Err(CallError::UnknownMethod {
                interface: self.contract.qualified_name().to_owned(),
                method: method.to_owned(),
            });
        }
        self.router.call(
            self.contract.qualified_name(),
            encode_invocation(method, args),
            self.timeout,
        )
    }

    /// Invokes `method` and decodes the result into `T`.
    ///
    /// # Errors
    ///
    /// See [`Proxy::invoke`]; additionally [`CallError::Decode`] when the
    /// result does not fit `T`.
    pub fn invoke_as<T>(&self, method: &str, args: Vec<Value>) -> Result<T, CallError>
    where
        T: DeserializeOwned,
    {
        let value = self.invoke(method, args)?;
        serde_json::from_value(value).map_err(|source| CallError::Decode {
            message_type: self.contract.qualified_name().to_owned(),
            source,
        })
    }
}

impl Router {
    /// Creates a stub speaking `contract` over this connection.
    #[must_use]
    pub fn proxy(&self, contract: impl Into<Arc<InterfaceContract>>, timeout: Duration) -> Proxy {
        Proxy {
            router: self.clone(),
            contract: contract.into(),
            timeout,
        }
    }

    /// Serves `contract` with `implementation` on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateHandler`] when the interface is
    /// already bound.
    pub fn bind_interface<I>(
        &self,
        contract: impl Into<Arc<InterfaceContract>>,
        implementation: I,
    ) -> Result<(), RegistrationError>
    where
        I: InterfaceImplementation + 'static,
    {
        let shared: Arc<InterfaceContract> = contract.into();
        let message_type = shared.qualified_name().to_owned();
        let handler = InterfaceHandler::new(shared, Arc::new(implementation));
        self.register_synchronous_handler(&message_type, handler)
    }
}

#[cfg(test)]
mod tests {
    use mockall::mock;
    use rstest::{fixture, rstest};

    use super::*;
    use crate::envelope::CorrelationId;
    use crate::failure::RemoteFailure;

    mock! {
        Calculator {}
        impl InterfaceImplementation for Calculator {
            fn invoke(&self, method: &MethodSignature, args: Vec<Value>) -> Result<Value, HandlerFailure>;
        }
    }

    const CALCULATOR: &str = "org.example.Calculator";

    #[fixture]
    fn calculator() -> Arc<InterfaceContract> {
        Arc::new(
            InterfaceContract::builder(CALCULATOR)
                .method(
                    "add",
                    [ValueShape::Integer, ValueShape::Integer],
                    ValueShape::Integer,
                )
                .method(
                    "add",
                    [ValueShape::String, ValueShape::String],
                    ValueShape::String,
                )
                .method("scale", [ValueShape::Number], ValueShape::Number)
                .method("reset", [], ValueShape::Null)
                .build(),
        )
    }

    fn request(content: Value) -> Envelope {
        Envelope::request(CALCULATOR, content, CorrelationId::new(1))
    }

    #[rstest]
    #[case::integer_overload(json!([1, 2]), vec![ValueShape::Integer, ValueShape::Integer])]
    #[case::string_overload(json!(["a", "b"]), vec![ValueShape::String, ValueShape::String])]
    fn resolves_overloads_by_shape(
        calculator: Arc<InterfaceContract>,
        #[case] arguments: Value,
        #[case] expected: Vec<ValueShape>,
    ) {
        let args = arguments.as_array().cloned().unwrap_or_default();
        let signature = calculator.resolve("add", &args).expect("overload resolves");
        assert_eq!(signature.params(), expected.as_slice());
    }

    #[rstest]
    #[case::wrong_arity("add", json!([1]))]
    #[case::mixed_shapes("add", json!([1, "b"]))]
    #[case::unknown_name("subtract", json!([1, 2]))]
    #[case::null_is_not_a_number("scale", json!([null]))]
    fn rejects_mismatched_invocations(
        calculator: Arc<InterfaceContract>,
        #[case] method: &str,
        #[case] arguments: Value,
    ) {
        let args = arguments.as_array().cloned().unwrap_or_default();
        assert!(calculator.resolve(method, &args).is_none());
    }

    #[rstest]
    fn numbers_accept_integers(calculator: Arc<InterfaceContract>) {
        assert!(calculator.resolve("scale", &[json!(3)]).is_some());
        assert!(calculator.resolve("scale", &[json!(2.5)]).is_some());
    }

    #[rstest]
    fn signatures_render_readably() {
        let signature = MethodSignature::new(
            "add",
            [ValueShape::Integer, ValueShape::Integer],
            ValueShape::Integer,
        );
        assert_eq!(signature.to_string(), "add(integer, integer) -> integer");
    }

    #[rstest]
    fn handler_invokes_the_matching_overload(calculator: Arc<InterfaceContract>) {
        let mut implementation = MockCalculator::new();
        implementation
            .expect_invoke()
            .withf(|method, args| {
                method.params() == [ValueShape::String, ValueShape::String]
                    && args == &vec![json!("a"), json!("b")]
            })
            .times(1)
            .returning(|_, _| Ok(json!("ab")));

        let handler = InterfaceHandler::new(calculator, Arc::new(implementation));
        let result = handler
            .on_request(&request(json!(["add", ["a", "b"]])))
            .expect("invocation succeeds");
        assert_eq!(result, json!("ab"));
    }

    #[rstest]
    fn null_arguments_mean_no_arguments(calculator: Arc<InterfaceContract>) {
        let mut implementation = MockCalculator::new();
        implementation
            .expect_invoke()
            .withf(|method, args| method.name() == "reset" && args.is_empty())
            .times(1)
            .returning(|_, _| Ok(Value::Null));

        let handler = InterfaceHandler::new(calculator, Arc::new(implementation));
        let result = handler
            .on_request(&request(json!(["reset", null])))
            .expect("invocation succeeds");
        assert_eq!(result, Value::Null);
    }

    #[rstest]
    fn unmatched_invocations_report_no_matching_method(calculator: Arc<InterfaceContract>) {
        let mut implementation = MockCalculator::new();
        implementation.expect_invoke().never();

        let handler = InterfaceHandler::new(calculator, Arc::new(implementation));
        let failure = handler
            .on_request(&request(json!(["add", [1, "b"]])))
            .expect_err("no overload matches");
        let remote = RemoteFailure::capture(&failure);
        assert!(remote.origin_type().ends_with("RpcDispatchError"));
        assert!(remote.message().contains("no method matching add"));
    }

    #[rstest]
    #[case::not_an_array(json!({"method": "add"}))]
    #[case::wrong_length(json!(["add"]))]
    #[case::method_not_string(json!([1, [1, 2]]))]
    #[case::arguments_not_array(json!(["add", 3]))]
    fn malformed_invocations_are_rejected(
        calculator: Arc<InterfaceContract>,
        #[case] content: Value,
    ) {
        let handler = InterfaceHandler::new(calculator, Arc::new(MockCalculator::new()));
        let failure = handler
            .on_request(&request(content))
            .expect_err("malformed invocation");
        assert!(failure.to_string().contains("malformed invocation"));
    }
}
