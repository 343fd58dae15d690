use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Why a template is being resolved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvePurpose {
    /// Resolved directly by the caller.
    Global,
    /// Resolved as the layout of another template.
    Layout,
    /// Resolved as an include of another template.
    Include,
}

impl fmt::Display for ResolvePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolvePurpose::Global => "global",
            ResolvePurpose::Layout => "layout",
            ResolvePurpose::Include => "include",
        })
    }
}

/// Identifies a template.
///
/// A key is made of the template name, the purpose it is resolved for and
/// optionally the key of the template that referenced it.  Keys are
/// compared by value and are cheap to clone.  Two keys are equal if and
/// only if all three components are equal, which is what the compilation
/// cache is keyed by.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateKey(Arc<KeyInner>);

#[derive(PartialEq, Eq, Hash, PartialOrd, Ord)]
struct KeyInner {
    name: Arc<str>,
    purpose: ResolvePurpose,
    context: Option<TemplateKey>,
}

impl TemplateKey {
    /// Creates a new key.
    pub fn new(name: &str, purpose: ResolvePurpose, context: Option<TemplateKey>) -> TemplateKey {
        TemplateKey(Arc::new(KeyInner {
            name: Arc::from(name),
            purpose,
            context,
        }))
    }

    /// Creates a key for a template resolved by the caller.
    pub fn global(name: &str) -> TemplateKey {
        TemplateKey::new(name, ResolvePurpose::Global, None)
    }

    /// Returns the name of the template.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Returns the purpose.
    pub fn purpose(&self) -> ResolvePurpose {
        self.0.purpose
    }

    /// Returns the key of the referencing template.
    pub fn context(&self) -> Option<&TemplateKey> {
        self.0.context.as_ref()
    }
}

impl fmt::Debug for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TemplateKey");
        s.field("name", &self.name());
        s.field("purpose", &self.purpose());
        if let Some(context) = self.context() {
            s.field("context", context);
        }
        s.finish()
    }
}

impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match (self.purpose(), self.context()) {
            (ResolvePurpose::Global, None) => Ok(()),
            (purpose, None) => write!(f, " ({})", purpose),
            (purpose, Some(context)) => write!(f, " ({} of {})", purpose, context.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    #[test]
    fn test_key_identity() {
        let page = TemplateKey::global("index");
        let a = TemplateKey::new("_layout", ResolvePurpose::Layout, Some(page.clone()));
        let b = TemplateKey::new("_layout", ResolvePurpose::Layout, Some(page.clone()));
        let c = TemplateKey::new("_layout", ResolvePurpose::Include, Some(page.clone()));
        let d = TemplateKey::new("_layout", ResolvePurpose::Layout, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        let set: HashSet<_> = [a, b, c, d].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_display() {
        let page = TemplateKey::global("index");
        assert_eq!(page.to_string(), "index");
        let layout = TemplateKey::new("_layout", ResolvePurpose::Layout, Some(page));
        assert_eq!(layout.to_string(), "_layout (layout of index)");
    }
}
