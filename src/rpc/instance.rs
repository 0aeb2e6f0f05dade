//! Interface descriptions and the per-instance method dispatch table.
//!
//! # Responsibilities
//! - Describe an RPC interface: methods, parameters, timeouts, return kinds
//! - Resolve parameter names through a pluggable strategy
//! - Build the immutable [`DispatchTable`] shared by every call to an instance
//!
//! # Design Decisions
//! - Tables are built once per [`RpcInstanceKey`] and cached by the owner
//!   (client or service registry); calls only read them
//! - A method's wire name is its override if it declares one, otherwise its name
//! - With the overwrite check on, two methods sharing a wire name is an error;
//!   with it off the later declaration wins

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::rpc::error::InstanceError;

/// Identity of a cached dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RpcInstanceKey {
    pub interface: String,
    pub request_mapping_name: String,
    pub version: String,
}

impl fmt::Display for RpcInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{})", self.interface, self.request_mapping_name, self.version)
    }
}

/// How a method's result is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnKind {
    /// The caller waits for a value.
    #[default]
    Value,
    /// The caller waits for completion; the value is ignored.
    Unit,
    /// Fire and forget: no response is requested.
    OneWay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSignature {
    /// Name declared alongside the method, if any.
    pub declared_name: Option<String>,
}

/// One method of an interface as declared by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    /// Name used on the wire instead of `name`.
    pub rpc_name: Option<String>,
    pub params: Vec<ParamSignature>,
    pub timeout_ms: Option<i64>,
    pub return_kind: ReturnKind,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rpc_name: None,
            params: Vec::new(),
            timeout_ms: None,
            return_kind: ReturnKind::Value,
        }
    }

    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSignature {
            declared_name: Some(name.into()),
        });
        self
    }

    /// A parameter whose name must come from the resolver.
    pub fn unnamed_param(mut self) -> Self {
        self.params.push(ParamSignature { declared_name: None });
        self
    }

    pub fn rpc_name(mut self, name: impl Into<String>) -> Self {
        self.rpc_name = Some(name.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn returns(mut self, kind: ReturnKind) -> Self {
        self.return_kind = kind;
        self
    }

    pub fn wire_name(&self) -> &str {
        self.rpc_name.as_deref().unwrap_or(&self.name)
    }
}

/// An RPC interface shared by client proxies and server implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub request_mapping_name: Option<String>,
    pub version: Option<String>,
    pub timeout_ms: Option<i64>,
    pub methods: Vec<MethodSignature>,
}

impl InterfaceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request_mapping_name: None,
            version: None,
            timeout_ms: None,
            methods: Vec::new(),
        }
    }

    pub fn request_mapping_name(mut self, name: impl Into<String>) -> Self {
        self.request_mapping_name = Some(name.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn method(mut self, method: MethodSignature) -> Self {
        self.methods.push(method);
        self
    }

    /// Explicit mapping name, else the interface name with a lowercase first letter.
    pub fn mapping_name(&self) -> String {
        if let Some(name) = &self.request_mapping_name {
            return name.clone();
        }
        let mut chars = self.name.chars();
        match chars.next() {
            Some(first) => first.to_lowercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    pub fn key(&self, default_version: &str) -> RpcInstanceKey {
        RpcInstanceKey {
            interface: self.name.clone(),
            request_mapping_name: self.mapping_name(),
            version: self.version.clone().unwrap_or_else(|| default_version.to_string()),
        }
    }
}

/// Immutable per-method metadata used to serialize and route calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMethodDescriptor {
    /// Name the method was declared with.
    pub name: String,
    /// Name on the wire.
    pub method_name: String,
    pub parameter_names: Vec<String>,
    pub timeout_ms: Option<i64>,
    pub return_kind: ReturnKind,
}

/// Strategy for naming a method's parameters.
pub trait ParameterNameResolver: Send + Sync {
    fn parameter_names(&self, interface: &InterfaceDescriptor, method: &MethodSignature) -> Option<Vec<String>>;
}

/// Uses names declared on the signature; undeclared parameters become `argN`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclaredNames;

impl ParameterNameResolver for DeclaredNames {
    fn parameter_names(&self, _interface: &InterfaceDescriptor, method: &MethodSignature) -> Option<Vec<String>> {
        Some(
            method
                .params
                .iter()
                .enumerate()
                .map(|(i, p)| p.declared_name.clone().unwrap_or_else(|| format!("arg{}", i)))
                .collect(),
        )
    }
}

/// Names read from a TOML descriptor file:
///
/// ```toml
/// [EchoService]
/// echo = ["message"]
/// ```
#[derive(Debug, Default, Clone)]
pub struct DescriptorFileNames {
    names: HashMap<String, HashMap<String, Vec<String>>>,
}

impl DescriptorFileNames {
    pub fn from_toml_str(content: &str) -> Result<Self, InstanceError> {
        let names = toml::from_str(content).map_err(|e| InstanceError::DescriptorFile(e.to_string()))?;
        Ok(Self { names })
    }

    pub fn load(path: &Path) -> Result<Self, InstanceError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| InstanceError::DescriptorFile(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }
}

impl ParameterNameResolver for DescriptorFileNames {
    fn parameter_names(&self, interface: &InterfaceDescriptor, method: &MethodSignature) -> Option<Vec<String>> {
        self.names.get(&interface.name)?.get(&method.name).cloned()
    }
}

/// Method lookup for one instance.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    pub key: RpcInstanceKey,
    pub interface_timeout_ms: Option<i64>,
    methods: HashMap<String, Arc<RpcMethodDescriptor>>,
    /// Declared name → wire name, for methods with an override.
    aliases: HashMap<String, String>,
}

impl DispatchTable {
    pub fn build(
        interface: &InterfaceDescriptor,
        default_version: &str,
        resolver: &dyn ParameterNameResolver,
        overwrite_check: bool,
    ) -> Result<Self, InstanceError> {
        let mut methods = HashMap::with_capacity(interface.methods.len());
        let mut aliases = HashMap::new();

        for signature in &interface.methods {
            let parameter_names = resolver.parameter_names(interface, signature).ok_or_else(|| {
                InstanceError::MissingParameterNames {
                    interface: interface.name.clone(),
                    method: signature.name.clone(),
                }
            })?;
            if parameter_names.len() != signature.params.len() {
                return Err(InstanceError::ParameterCount {
                    interface: interface.name.clone(),
                    method: signature.name.clone(),
                    expected: signature.params.len(),
                    found: parameter_names.len(),
                });
            }

            let method_name = signature.wire_name().to_string();
            if overwrite_check && methods.contains_key(&method_name) {
                return Err(InstanceError::DuplicateMethod {
                    interface: interface.name.clone(),
                    method: method_name,
                });
            }
            let descriptor = RpcMethodDescriptor {
                name: signature.name.clone(),
                method_name: method_name.clone(),
                parameter_names,
                timeout_ms: signature.timeout_ms,
                return_kind: signature.return_kind,
            };
            if signature.name != method_name {
                aliases.insert(signature.name.clone(), method_name.clone());
            }
            methods.insert(method_name, Arc::new(descriptor));
        }

        tracing::debug!(
            instance = %interface.key(default_version),
            methods = methods.len(),
            "Dispatch table built"
        );

        Ok(Self {
            key: interface.key(default_version),
            interface_timeout_ms: interface.timeout_ms,
            methods,
            aliases,
        })
    }

    /// Look up by wire name, falling back to the declared name.
    pub fn method(&self, name: &str) -> Option<&Arc<RpcMethodDescriptor>> {
        self.methods
            .get(name)
            .or_else(|| self.aliases.get(name).and_then(|wire| self.methods.get(wire)))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}
