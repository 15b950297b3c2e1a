use std::fmt;
use std::sync::Arc;

use knobs_store::codec;
use knobs_store::{MetadataShape, Setting, SettingType, SettingsError, Value};

/// Derives a new value from an existing setting during migration.
pub type Transform = Arc<dyn Fn(&Setting) -> Option<Value> + Send + Sync>;

/// Desired state of one setting.
#[derive(Clone)]
pub struct Declaration {
    pub name: String,
    pub kind: SettingType,
    pub default: Option<Value>,
    pub enabled: bool,
    pub group: String,
    pub bag: String,
    /// Existing setting whose values seed this one.
    pub from: Option<String>,
    pub using: Option<Transform>,
}

impl Declaration {
    /// A string setting in `bag`, enabled, in the `default` group.
    pub fn new(name: impl Into<String>, bag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SettingType::String,
            default: None,
            enabled: true,
            group: "default".into(),
            bag: bag.into(),
            from: None,
            using: None,
        }
    }

    pub fn kind(mut self, kind: SettingType) -> Self {
        self.kind = kind;
        self
    }

    pub fn string(self) -> Self {
        self.kind(SettingType::String)
    }

    pub fn integer(self) -> Self {
        self.kind(SettingType::Integer)
    }

    pub fn float(self) -> Self {
        self.kind(SettingType::Float)
    }

    pub fn boolean(self) -> Self {
        self.kind(SettingType::Boolean)
    }

    pub fn array(self) -> Self {
        self.kind(SettingType::Array)
    }

    pub fn collection(self) -> Self {
        self.kind(SettingType::Collection)
    }

    pub fn datetime(self) -> Self {
        self.kind(SettingType::DateTime)
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn bag(mut self, bag: impl Into<String>) -> Self {
        self.bag = bag.into();
        self
    }

    pub fn from(mut self, old: impl Into<String>) -> Self {
        self.from = Some(old.into());
        self
    }

    pub fn using<F>(mut self, transform: F) -> Self
    where
        F: Fn(&Setting) -> Option<Value> + Send + Sync + 'static,
    {
        self.using = Some(Arc::new(transform));
        self
    }

    /// Metadata this declaration should persist as. The default is encoded
    /// with the declared type.
    pub fn to_shape(&self) -> Result<MetadataShape, SettingsError> {
        Ok(MetadataShape {
            name: self.name.clone(),
            kind: self.kind,
            default: codec::encode(self.kind, self.default.as_ref())?,
            is_enabled: self.enabled,
            group: self.group.clone(),
            bag: self.bag.clone(),
        })
    }

    /// Runs the transform, if any, and encodes its output with the declared type.
    pub fn transform(&self, setting: &Setting) -> Result<Option<Option<String>>, SettingsError> {
        match &self.using {
            Some(using) => Ok(Some(codec::encode(self.kind, using(setting).as_ref())?)),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declaration")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("default", &self.default)
            .field("enabled", &self.enabled)
            .field("group", &self.group)
            .field("bag", &self.bag)
            .field("from", &self.from)
            .field("using", &self.using.as_ref().map(|_| "<transform>"))
            .finish()
    }
}
