use knobs_store::config::DEFAULT_BAG;
use knobs_store::{Setting, Value};

use crate::declaration::Declaration;
use crate::error::MigrateError;
use crate::manifest::Manifest;

/// Produces the full set of declarations a migration reconciles against.
pub trait DeclarationSource {
    fn declarations(&self) -> Result<Vec<Declaration>, MigrateError>;
}

/// In-process declaration list. Names are unique; re-declaring a name
/// replaces the earlier declaration in place.
#[derive(Debug, Clone)]
pub struct SettingRegistrar {
    default_bag: String,
    declarations: Vec<Declaration>,
}

impl Default for SettingRegistrar {
    fn default() -> Self {
        Self::new(DEFAULT_BAG)
    }
}

impl SettingRegistrar {
    pub fn new(default_bag: impl Into<String>) -> Self {
        Self { default_bag: default_bag.into(), declarations: Vec::new() }
    }

    pub fn default_bag(&self) -> &str {
        &self.default_bag
    }

    /// Starts a declaration in the default bag, for use with [`declare`](Self::declare).
    pub fn name(&self, name: impl Into<String>) -> Declaration {
        Declaration::new(name, self.default_bag.clone())
    }

    pub fn declare(&mut self, declaration: Declaration) -> &mut Self {
        match self.declarations.iter_mut().find(|d| d.name == declaration.name) {
            Some(existing) => *existing = declaration,
            None => self.declarations.push(declaration),
        }
        self
    }

    /// Declares every manifest entry. Entries without a bag get the default one.
    pub fn merge(&mut self, manifest: &Manifest) -> Result<&mut Self, MigrateError> {
        for declaration in manifest.declarations(&self.default_bag)? {
            self.declare(declaration);
        }
        Ok(self)
    }

    /// Attaches a transform to an already declared setting. Returns whether
    /// the name was found.
    pub fn using<F>(&mut self, name: &str, transform: F) -> bool
    where
        F: Fn(&Setting) -> Option<Value> + Send + Sync + 'static,
    {
        match self.declarations.iter().position(|d| d.name == name) {
            Some(i) => {
                let declaration = self.declarations.remove(i).using(transform);
                self.declarations.insert(i, declaration);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Declaration> {
        self.declarations.iter().find(|d| d.name == name)
    }

    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    /// Declarations that migrate values from another setting.
    pub fn migrable(&self) -> Vec<&Declaration> {
        self.declarations.iter().filter(|d| d.from.is_some()).collect()
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

impl DeclarationSource for SettingRegistrar {
    fn declarations(&self) -> Result<Vec<Declaration>, MigrateError> {
        Ok(self.declarations.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knobs_store::SettingType;

    #[test]
    fn last_declaration_wins() {
        let mut registrar = SettingRegistrar::new("members");
        let first = registrar.name("color");
        let second = registrar.name("color").integer().default(3);
        registrar.declare(first).declare(second);

        assert_eq!(registrar.len(), 1);
        let color = registrar.get("color").unwrap();
        assert_eq!(color.kind, SettingType::Integer);
        assert_eq!(color.bag, "members");
    }

    #[test]
    fn declaration_order_is_kept() {
        let mut registrar = SettingRegistrar::default();
        for name in ["c", "a", "b"] {
            let d = registrar.name(name);
            registrar.declare(d);
        }
        let d = registrar.name("a").boolean();
        registrar.declare(d);
        let names: Vec<&str> = registrar.declarations().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn migrable_lists_from_declarations() {
        let mut registrar = SettingRegistrar::default();
        let plain = registrar.name("plain");
        let moved = registrar.name("moved").from("old");
        registrar.declare(plain).declare(moved);

        let migrable = registrar.migrable();
        assert_eq!(migrable.len(), 1);
        assert_eq!(migrable[0].name, "moved");
    }

    #[test]
    fn using_attaches_to_existing_only() {
        let mut registrar = SettingRegistrar::default();
        let d = registrar.name("x").from("y");
        registrar.declare(d);
        assert!(registrar.using("x", |_| None));
        assert!(!registrar.using("missing", |_| None));
        assert!(registrar.get("x").unwrap().using.is_some());
    }
}
