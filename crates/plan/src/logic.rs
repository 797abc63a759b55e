//! User functions and their live-tunable control attributes.
//!
//! An operator exposes knobs (a window size, a threshold) by registering a
//! [`ControlAttribute`]: a name plus getter/setter closures over the operator's
//! own fields. Values cross the registry as `serde_json::Value`, so callers can
//! tune an attribute without knowing the concrete operator type.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::Result;

/// A user-defined function hosted by an operator.
///
/// Identity matters: two plans carry "the same" function exactly when they
/// share the same allocation (see [`same_udf`]).
pub trait UserFunction: Send + Sync + fmt::Debug {
    /// Human readable name, used in logs and by task executors.
    fn name(&self) -> &str;
}

/// Shared handle to a user function.
pub type Udf = Arc<dyn UserFunction>;

/// Whether `a` and `b` are the same function instance.
pub fn same_udf(a: &Udf, b: &Udf) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

type Getter = Arc<dyn Fn() -> Value + Send + Sync>;
type Setter = Arc<dyn Fn(Value) -> Result<()> + Send + Sync>;

/// A named, typed knob of an operator.
#[derive(Clone)]
pub struct ControlAttribute {
    name: String,
    getter: Getter,
    setter: Setter,
}

impl ControlAttribute {
    /// Register an attribute of type `T`.
    pub fn new<T, G, S>(name: impl Into<String>, getter: G, setter: S) -> Self
    where
        T: Serialize + DeserializeOwned,
        G: Fn() -> T + Send + Sync + 'static,
        S: Fn(T) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            getter: Arc::new(move || serde_json::to_value(getter()).unwrap_or(Value::Null)),
            setter: Arc::new(move |value: Value| -> Result<()> {
                let typed: T = serde_json::from_value(value)?;
                setter(typed);
                Ok(())
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value read from the operator.
    pub fn get(&self) -> Value {
        (self.getter)()
    }

    /// Write `value` into the operator. Fails if it does not decode as the
    /// attribute's type.
    pub fn set(&self, value: Value) -> Result<()> {
        (self.setter)(value)
    }
}

impl fmt::Debug for ControlAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlAttribute")
            .field("name", &self.name)
            .field("value", &self.get())
            .finish()
    }
}

/// The processing logic of an operator: its user function and the control
/// attributes it registered.
///
/// Attribute writes made on a plan are staged; they reach the operator only
/// when [`ApplicationLogic::apply_staged`] runs, which the coordinator does on
/// its held plan.
#[derive(Clone, Default)]
pub struct ApplicationLogic {
    udf: Option<Udf>,
    attributes: BTreeMap<String, ControlAttribute>,
    staged: BTreeMap<String, Value>,
}

impl ApplicationLogic {
    pub fn new(udf: Udf) -> Self {
        Self {
            udf: Some(udf),
            ..Default::default()
        }
    }

    /// Register a control attribute.
    pub fn with_attribute(mut self, attribute: ControlAttribute) -> Self {
        self.attributes.insert(attribute.name.clone(), attribute);
        self
    }

    pub fn udf(&self) -> Option<&Udf> {
        self.udf.as_ref()
    }

    pub fn set_udf(&mut self, udf: Udf) {
        self.udf = Some(udf);
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Value of one attribute, staged value first.
    pub fn control_attribute(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.staged.get(name) {
            return Some(value.clone());
        }
        self.attributes.get(name).map(ControlAttribute::get)
    }

    /// All attribute values, staged values first.
    pub fn control_attribute_map(&self) -> BTreeMap<String, Value> {
        self.attributes
            .keys()
            .filter_map(|name| Some((name.clone(), self.control_attribute(name)?)))
            .collect()
    }

    /// Stage a new value. Returns `false` if no such attribute is registered.
    pub fn stage_attribute(&mut self, name: &str, value: Value) -> bool {
        if !self.attributes.contains_key(name) {
            return false;
        }
        self.staged.insert(name.to_string(), value);
        true
    }

    pub fn staged_attributes(&self) -> &BTreeMap<String, Value> {
        &self.staged
    }

    /// Push every staged value through its setter and return the names applied.
    pub fn apply_staged(&mut self) -> Result<Vec<String>> {
        let staged = std::mem::take(&mut self.staged);
        let mut applied = Vec::with_capacity(staged.len());
        for (name, value) in staged {
            if let Some(attribute) = self.attributes.get(&name) {
                attribute.set(value)?;
                applied.push(name);
            }
        }
        Ok(applied)
    }
}

impl fmt::Debug for ApplicationLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationLogic")
            .field("udf", &self.udf.as_ref().map(|udf| udf.name().to_string()))
            .field("attributes", &self.control_attribute_map())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug)]
    struct Splitter;

    impl UserFunction for Splitter {
        fn name(&self) -> &str {
            "splitter"
        }
    }

    fn window_logic(size: Arc<AtomicU64>) -> ApplicationLogic {
        let read = size.clone();
        ApplicationLogic::new(Arc::new(Splitter)).with_attribute(ControlAttribute::new(
            "window_size",
            move || read.load(Ordering::SeqCst),
            move |value: u64| size.store(value, Ordering::SeqCst),
        ))
    }

    #[test]
    fn test_udf_identity() {
        let a: Udf = Arc::new(Splitter);
        let b: Udf = Arc::new(Splitter);
        assert!(same_udf(&a, &a.clone()));
        assert!(!same_udf(&a, &b));
    }

    #[test]
    fn test_staged_attribute_applies_through_setter() {
        let size = Arc::new(AtomicU64::new(5));
        let mut logic = window_logic(size.clone());

        assert_eq!(logic.control_attribute("window_size"), Some(json!(5)));
        assert!(logic.stage_attribute("window_size", json!(10)));
        assert_eq!(logic.control_attribute("window_size"), Some(json!(10)));
        assert_eq!(size.load(Ordering::SeqCst), 5);

        let applied = logic.apply_staged().unwrap();
        assert_eq!(applied, vec!["window_size".to_string()]);
        assert_eq!(size.load(Ordering::SeqCst), 10);
        assert!(logic.staged_attributes().is_empty());
    }

    #[test]
    fn test_unknown_and_mistyped_attributes() {
        let size = Arc::new(AtomicU64::new(5));
        let mut logic = window_logic(size.clone());

        assert!(!logic.stage_attribute("missing", json!(1)));
        assert!(logic.stage_attribute("window_size", json!("ten")));
        assert!(logic.apply_staged().is_err());
        assert_eq!(size.load(Ordering::SeqCst), 5);
    }
}
