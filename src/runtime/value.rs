//! Script value types
//!
//! The scheduler treats values opaquely; this module is the narrow slice of
//! the value/object model it needs: plain values, objects with identity,
//! thrown error objects, and callable functions that carry an explicit
//! receiver binding.

use super::async_runtime::{self, TaskBody, TaskCx};
use super::promise::Deferred;
use crate::error::{Completion, ErrorKind};
use crate::event_loop::Scheduler;
use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

/// Type alias for native function implementations: `(scheduler, this, args)`
pub type NativeFn = Rc<dyn Fn(&Scheduler, &Value, &[Value]) -> Completion>;

/// Type alias for suspension-capable function bodies
pub type AsyncFn = Rc<dyn Fn(TaskCx, Vec<Value>) -> TaskBody>;

/// A script value
#[derive(Clone)]
pub enum Value {
    /// undefined
    Undefined,
    /// null
    Null,
    /// Boolean value
    Boolean(bool),
    /// Number (IEEE 754 double)
    Number(f64),
    /// String
    String(String),
    /// Object (includes arrays, errors, functions and deferreds)
    Object(Rc<RefCell<Object>>),
}

impl Value {
    /// Check if value is undefined
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Check if value is nullish (null or undefined)
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Convert to boolean (truthiness)
    pub fn to_boolean(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Object(_) => true,
        }
    }

    /// Convert to number
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Boolean(true) => 1.0,
            Value::Boolean(false) => 0.0,
            Value::Number(n) => *n,
            Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
            Value::Object(_) => f64::NAN,
        }
    }

    /// Number payload, if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String payload, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to the script's string representation
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Boolean(true) => "true".to_string(),
            Value::Boolean(false) => "false".to_string(),
            Value::Number(n) => {
                if n.is_nan() {
                    "NaN".to_string()
                } else if n.is_infinite() {
                    if *n > 0.0 {
                        "Infinity".to_string()
                    } else {
                        "-Infinity".to_string()
                    }
                } else if *n == 0.0 {
                    "0".to_string()
                } else {
                    format!("{}", n)
                }
            }
            Value::String(s) => s.clone(),
            Value::Object(obj) => {
                let obj = obj.borrow();
                match &obj.kind {
                    ObjectKind::Array(arr) => {
                        let elements: Vec<String> = arr.iter().map(|v| v.to_js_string()).collect();
                        elements.join(",")
                    }
                    ObjectKind::Error { name, message } => format!("{}: {}", name, message),
                    ObjectKind::Function(func) => format!("[Function: {}]", func.name()),
                    ObjectKind::Deferred(_) => "[object Promise]".to_string(),
                    ObjectKind::Ordinary => "[object Object]".to_string(),
                }
            }
        }
    }

    /// Get the typeof string
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Object(obj) => match obj.borrow().kind {
                ObjectKind::Function(_) => "function",
                _ => "object",
            },
        }
    }

    /// Strict equality (===); objects compare by identity
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => {
                if a.is_nan() || b.is_nan() {
                    false
                } else {
                    a == b
                }
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Create a new object value
    pub fn new_object() -> Value {
        Value::Object(Rc::new(RefCell::new(Object::new())))
    }

    /// Create a new object value with properties
    pub fn new_object_with_properties(properties: HashMap<String, Value>) -> Value {
        Value::Object(Rc::new(RefCell::new(Object {
            kind: ObjectKind::Ordinary,
            properties,
            prototype: None,
        })))
    }

    /// Create an object whose missing properties are looked up on `prototype`
    pub fn new_object_with_prototype(prototype: &Value) -> Value {
        let proto = match prototype {
            Value::Object(obj) => Some(obj.clone()),
            _ => None,
        };
        Value::Object(Rc::new(RefCell::new(Object {
            kind: ObjectKind::Ordinary,
            properties: HashMap::default(),
            prototype: proto,
        })))
    }

    /// Create a new array value
    pub fn new_array(elements: Vec<Value>) -> Value {
        Value::with_kind(ObjectKind::Array(elements))
    }

    /// Create an error object (`{ name, message }`)
    pub fn new_error(kind: ErrorKind, message: &str) -> Value {
        Value::with_kind(ObjectKind::Error {
            name: kind.to_string(),
            message: message.to_string(),
        })
    }

    /// Wrap a function
    pub fn new_function(func: Function) -> Value {
        Value::with_kind(ObjectKind::Function(func))
    }

    fn with_kind(kind: ObjectKind) -> Value {
        Value::Object(Rc::new(RefCell::new(Object {
            kind,
            properties: HashMap::default(),
            prototype: None,
        })))
    }

    /// Get a property (own, then prototype chain)
    pub fn get_property(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(obj) => obj.borrow().get_property(key),
            Value::String(s) if key == "length" => Some(Value::Number(s.chars().count() as f64)),
            _ => None,
        }
    }

    /// Set an own property; returns false for non-objects
    pub fn set_property(&self, key: &str, value: Value) -> bool {
        match self {
            Value::Object(obj) => {
                obj.borrow_mut().set_property(key, value);
                true
            }
            _ => false,
        }
    }

    /// Elements of an array value
    pub fn as_array(&self) -> Option<Vec<Value>> {
        match self {
            Value::Object(obj) => match &obj.borrow().kind {
                ObjectKind::Array(arr) => Some(arr.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// The function behind a callable value
    pub fn as_function(&self) -> Option<Function> {
        match self {
            Value::Object(obj) => match &obj.borrow().kind {
                ObjectKind::Function(func) => Some(func.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// The deferred behind a promise value
    pub fn as_deferred(&self) -> Option<Deferred> {
        match self {
            Value::Object(obj) => match &obj.borrow().kind {
                ObjectKind::Deferred(d) => Some(d.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Check if value is callable
    pub fn is_callable(&self) -> bool {
        self.as_function().is_some()
    }

    /// A non-deferred object exposing a callable `then`
    pub fn thenable_then(&self) -> Option<Function> {
        match self {
            Value::Object(obj) => {
                let obj = obj.borrow();
                if matches!(obj.kind, ObjectKind::Deferred(_)) {
                    return None;
                }
                obj.get_property("then").and_then(|then| then.as_function())
            }
            _ => None,
        }
    }

    /// Call this value as a function with an explicit receiver
    pub fn call(&self, sched: &Scheduler, this: &Value, args: &[Value]) -> Completion {
        match self.as_function() {
            Some(func) => func.call(sched, this, args),
            None => Err(Value::new_error(
                ErrorKind::TypeError,
                &format!("{} is not a function", self.type_of()),
            )),
        }
    }

    /// Look up `name` on this value and call it with this value as receiver
    pub fn call_method(&self, sched: &Scheduler, name: &str, args: &[Value]) -> Completion {
        match self.get_property(name) {
            Some(method) => method.call(sched, self, args),
            None => Err(Value::new_error(
                ErrorKind::TypeError,
                &format!("{} is not a function", name),
            )),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.strict_equals(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Object(obj) => {
                let obj = obj.borrow();
                match &obj.kind {
                    ObjectKind::Ordinary => write!(f, "{{...}}"),
                    ObjectKind::Array(arr) => write!(f, "{:?}", arr),
                    ObjectKind::Error { name, message } => write!(f, "{}: {}", name, message),
                    ObjectKind::Function(func) => write!(f, "[Function: {}]", func.name()),
                    ObjectKind::Deferred(d) => write!(f, "{:?}", d),
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_js_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Deferred> for Value {
    fn from(d: Deferred) -> Self {
        Value::with_kind(ObjectKind::Deferred(d))
    }
}

impl From<Function> for Value {
    fn from(func: Function) -> Self {
        Value::new_function(func)
    }
}

/// Script object
#[derive(Clone)]
pub struct Object {
    /// Object kind
    pub kind: ObjectKind,
    /// Properties
    pub properties: HashMap<String, Value>,
    /// Prototype
    pub prototype: Option<Rc<RefCell<Object>>>,
}

impl Object {
    /// Create a new ordinary object
    pub fn new() -> Self {
        Self {
            kind: ObjectKind::Ordinary,
            properties: HashMap::default(),
            prototype: None,
        }
    }

    /// Get a property
    pub fn get_property(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.properties.get(key) {
            return Some(value.clone());
        }
        match (&self.kind, key) {
            (ObjectKind::Array(arr), "length") => return Some(Value::Number(arr.len() as f64)),
            (ObjectKind::Array(arr), _) => {
                if let Ok(idx) = key.parse::<usize>() {
                    return arr.get(idx).cloned();
                }
            }
            (ObjectKind::Error { name, .. }, "name") => return Some(Value::String(name.clone())),
            (ObjectKind::Error { message, .. }, "message") => {
                return Some(Value::String(message.clone()))
            }
            (ObjectKind::Function(func), "name") => {
                return Some(Value::String(func.name().to_string()))
            }
            _ => {}
        }
        self.prototype
            .as_ref()
            .and_then(|proto| proto.borrow().get_property(key))
    }

    /// Set a property
    pub fn set_property(&mut self, key: &str, value: Value) {
        if let ObjectKind::Array(arr) = &mut self.kind {
            if let Ok(idx) = key.parse::<usize>() {
                if idx >= arr.len() {
                    arr.resize(idx + 1, Value::Undefined);
                }
                arr[idx] = value;
                return;
            }
        }
        self.properties.insert(key.to_string(), value);
    }

    /// Check own properties only
    pub fn has_own_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

/// Object kinds the scheduler distinguishes
#[derive(Clone)]
pub enum ObjectKind {
    /// Plain object
    Ordinary,
    /// Array with dense elements
    Array(Vec<Value>),
    /// Thrown error object
    Error { name: String, message: String },
    /// Callable
    Function(Function),
    /// Deferred-computation object (a promise)
    Deferred(Deferred),
}

/// A callable: native code or a suspension-capable body, optionally bound
/// to a fixed receiver.
///
/// The `(code, receiver)` pair is explicit: a bound function always runs
/// against its bound receiver, and a suspension-capable body captures the
/// receiver it was invoked with into its task context for every resumption.
#[derive(Clone)]
pub struct Function(Rc<FunctionInner>);

struct FunctionInner {
    name: String,
    code: FunctionCode,
    bound_this: Option<Value>,
}

#[derive(Clone)]
enum FunctionCode {
    Native(NativeFn),
    Async(AsyncFn),
}

impl Function {
    /// Create a native function
    pub fn native<F>(name: &str, func: F) -> Self
    where
        F: Fn(&Scheduler, &Value, &[Value]) -> Completion + 'static,
    {
        Function(Rc::new(FunctionInner {
            name: name.to_string(),
            code: FunctionCode::Native(Rc::new(func)),
            bound_this: None,
        }))
    }

    /// Create a suspension-capable function. Calling it starts a task
    /// context and returns a promise for the body's outcome.
    pub fn new_async<F, Fut>(name: &str, body: F) -> Self
    where
        F: Fn(TaskCx, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = Completion> + 'static,
    {
        let code: AsyncFn = Rc::new(move |cx, args| Box::pin(body(cx, args)));
        Function(Rc::new(FunctionInner {
            name: name.to_string(),
            code: FunctionCode::Async(code),
            bound_this: None,
        }))
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Whether calling this function starts a task context
    pub fn is_async(&self) -> bool {
        matches!(self.0.code, FunctionCode::Async(_))
    }

    /// The receiver this function is bound to, if any
    pub fn bound_receiver(&self) -> Option<&Value> {
        self.0.bound_this.as_ref()
    }

    /// `Function.prototype.bind`: fix the receiver. Binding an already
    /// bound function keeps the original receiver.
    pub fn bind(&self, receiver: Value) -> Function {
        let bound_this = match &self.0.bound_this {
            Some(existing) => existing.clone(),
            None => receiver,
        };
        Function(Rc::new(FunctionInner {
            name: format!("bound {}", self.0.name),
            code: self.0.code.clone(),
            bound_this: Some(bound_this),
        }))
    }

    /// Invoke with an explicit receiver. A bound receiver wins over `this`.
    pub fn call(&self, sched: &Scheduler, this: &Value, args: &[Value]) -> Completion {
        let receiver = self.0.bound_this.as_ref().unwrap_or(this);
        match &self.0.code {
            FunctionCode::Native(func) => func(sched, receiver, args),
            FunctionCode::Async(body) => {
                let body = body.clone();
                let args = args.to_vec();
                let deferred = async_runtime::spawn_task(
                    sched,
                    &self.0.name,
                    receiver.clone(),
                    move |cx| body(cx, args),
                );
                Ok(Value::from(deferred))
            }
        }
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &Function) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Function: {}]", self.0.name)
    }
}
