//! Service definitions.
//!
//! A service is a named receiver plus a table of methods. Each method is
//! registered with a typed closure of the shape `(&T, A, &mut R) -> Result<(), E>`;
//! the builder erases the argument and reply types into an invocation
//! closure over documents, so dispatch never inspects types at call time.
//!
//! ```
//! use brpc_server::Service;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Args {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! struct Foo;
//!
//! let service = Service::builder("Foo", Foo)
//!     .method("Sum", |_: &Foo, args: Args, reply: &mut i64| {
//!         *reply = args.num1 + args.num2;
//!         Ok::<_, String>(())
//!     })
//!     .build()
//!     .unwrap();
//! assert_eq!(service.method_names(), vec!["Sum"]);
//! ```

use crate::error::RegistryError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Invocation = Box<dyn FnOnce() -> Result<Value, RegistryError> + Send>;
type Preparer = Box<dyn Fn(Value) -> Result<Invocation, RegistryError> + Send + Sync>;

/// Returns whether a service or method name is exported (starts with an
/// uppercase letter).
pub fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

/// A callable method of a service.
pub struct MethodDescriptor {
    service: String,
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    calls: Arc<AtomicU64>,
    prepare: Preparer,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full `"Service.Method"` name.
    pub fn service_method(&self) -> String {
        format!("{}.{}", self.service, self.name)
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of times the method has been invoked.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Decodes the argument and binds it to the method.
    pub fn prepare(&self, arg: Value) -> Result<PreparedCall, RegistryError> {
        let invocation = (self.prepare)(arg)?;
        Ok(PreparedCall {
            calls: self.calls.clone(),
            invocation,
        })
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("service", &self.service)
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("calls", &self.call_count())
            .finish()
    }
}

/// A method bound to a decoded argument, ready to run.
pub struct PreparedCall {
    calls: Arc<AtomicU64>,
    invocation: Invocation,
}

impl PreparedCall {
    /// Runs the method and returns the encoded reply.
    ///
    /// Blocks for as long as the method does; the server runs this on the
    /// blocking pool.
    pub fn invoke(self) -> Result<Value, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.invocation)()
    }
}

/// A registered service.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl Service {
    /// Starts building a service around `receiver`.
    pub fn builder<T: Send + Sync + 'static>(
        name: impl Into<String>,
        receiver: T,
    ) -> ServiceBuilder<T> {
        ServiceBuilder {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
            duplicate: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodDescriptor>> {
        self.methods.get(name)
    }

    /// Returns the method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Decodes `arg`, runs the named method and returns its reply.
    pub fn call(&self, method: &str, arg: Value) -> Result<Value, RegistryError> {
        let descriptor = self
            .methods
            .get(method)
            .ok_or_else(|| RegistryError::UnknownMethod(method.to_string()))?;
        descriptor.prepare(arg)?.invoke()
    }
}

/// Builder for [`Service`].
pub struct ServiceBuilder<T> {
    name: String,
    receiver: Arc<T>,
    methods: HashMap<String, Arc<MethodDescriptor>>,
    duplicate: Option<String>,
}

impl<T: Send + Sync + 'static> ServiceBuilder<T> {
    /// Adds a method.
    ///
    /// The reply starts as `R::default()`, so maps and sequences arrive empty
    /// and ready to fill. Names that are not exported are skipped.
    pub fn method<A, R, E, F>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        E: Display,
        F: Fn(&T, A, &mut R) -> Result<(), E> + Send + Sync + 'static,
    {
        if !is_exported(name) {
            tracing::debug!("rpc server: skipping unexported method {}.{}", self.name, name);
            return self;
        }
        if self.methods.contains_key(name) {
            self.duplicate.get_or_insert_with(|| name.to_string());
            return self;
        }

        let service_method = format!("{}.{}", self.name, name);
        let receiver = self.receiver.clone();
        let f = Arc::new(f);

        let prepare: Preparer = Box::new(move |arg: Value| -> Result<Invocation, RegistryError> {
            let args: A =
                serde_json::from_value(arg).map_err(|e| RegistryError::InvalidArgument {
                    service_method: service_method.clone(),
                    message: e.to_string(),
                })?;

            let receiver = receiver.clone();
            let f = f.clone();
            let service_method = service_method.clone();
            let invocation: Invocation = Box::new(move || -> Result<Value, RegistryError> {
                let mut reply = R::default();
                f(receiver.as_ref(), args, &mut reply)
                    .map_err(|e| RegistryError::MethodFailed(e.to_string()))?;
                serde_json::to_value(&reply).map_err(|e| RegistryError::InvalidReply {
                    service_method,
                    message: e.to_string(),
                })
            });
            Ok(invocation)
        });

        let descriptor = MethodDescriptor {
            service: self.name.clone(),
            name: name.to_string(),
            arg_type: std::any::type_name::<A>(),
            reply_type: std::any::type_name::<R>(),
            calls: Arc::new(AtomicU64::new(0)),
            prepare,
        };
        self.methods.insert(name.to_string(), Arc::new(descriptor));
        self
    }

    /// Finishes the service.
    pub fn build(self) -> Result<Service, RegistryError> {
        if !is_exported(&self.name) {
            return Err(RegistryError::InvalidServiceName(self.name));
        }
        if let Some(method) = self.duplicate {
            return Err(RegistryError::DuplicateMethod {
                service: self.name,
                method,
            });
        }

        for method in self.methods.keys() {
            tracing::info!("rpc server: register {}.{}", self.name, method);
        }

        Ok(Service {
            name: self.name,
            methods: self.methods,
        })
    }
}
