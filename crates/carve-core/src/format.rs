//! Format providers and the registry the scheduler probes them from.
//!
//! Registries are plain values handed to a [`Scheduler`](crate::scan::Scheduler)
//! when it is created, so independent sessions can enable different formats.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::spec::FormatSpec;

/// A recognizable file format
///
/// Implementations expose two specs: a header spec probed against the first
/// bytes of every input, and the full spec decoded once the header matched.
pub trait Format: Send + Sync {
    /// Short unique name, used for filtering and as the result node name
    fn name(&self) -> &str;

    /// Spec probed against the start of an input
    fn header(&self) -> &FormatSpec;

    /// Spec decoded after the header matched
    fn spec(&self) -> &FormatSpec;
}

/// A [`Format`] assembled from two specs
#[derive(Debug, Clone)]
pub struct SpecFormat {
    name: String,
    header: FormatSpec,
    spec: FormatSpec,
}

impl SpecFormat {
    /// Creates a format from its header and full specs
    pub fn new(name: impl Into<String>, header: impl Into<FormatSpec>, spec: impl Into<FormatSpec>) -> Self {
        Self {
            name: name.into(),
            header: header.into(),
            spec: spec.into(),
        }
    }
}

impl Format for SpecFormat {
    fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> &FormatSpec {
        &self.header
    }

    fn spec(&self) -> &FormatSpec {
        &self.spec
    }
}

/// Ordered set of formats; earlier registrations win ties
#[derive(Clone, Default)]
pub struct FormatRegistry {
    formats: Vec<Arc<dyn Format>>,
}

impl FormatRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in format, in a fixed order
    #[cfg(feature = "builtin-formats")]
    pub fn builtin() -> Self {
        crate::formats::all()
            .into_iter()
            .fold(Self::new(), |registry, format| registry.register(format))
    }

    /// Appends a format
    pub fn register(mut self, format: impl Format + 'static) -> Self {
        self.formats.push(Arc::new(format));
        self
    }

    /// Appends a shared format
    pub fn add(&mut self, format: Arc<dyn Format>) {
        self.formats.push(format);
    }

    /// Keeps only the formats whose name appears in `names`, preserving order
    pub fn retain_names<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.formats
            .retain(|f| names.iter().any(|n| n.as_ref().eq_ignore_ascii_case(f.name())));
        self
    }

    /// Registered formats, in probing order
    pub fn formats(&self) -> &[Arc<dyn Format>] {
        &self.formats
    }

    /// Names of the registered formats, in probing order
    pub fn names(&self) -> Vec<&str> {
        self.formats.iter().map(|f| f.name()).collect()
    }

    /// Number of registered formats
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Whether no format is registered
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Largest header size of any registered format
    pub fn header_size(&self) -> u64 {
        self.formats
            .iter()
            .map(|f| f.header().match_size())
            .max()
            .unwrap_or(0)
    }

    /// First format, in registration order, whose header matches `data`
    pub fn detect(&self, data: &[u8]) -> Option<Arc<dyn Format>> {
        self.formats
            .iter()
            .find(|format| {
                // A header that checks nothing would claim every input
                if format.header().match_size() == 0 {
                    return false;
                }
                let outcome = format.header().probe_bytes(data);
                trace!("probed '{}': {:?}", format.name(), outcome);
                outcome.is_match()
            })
            .cloned()
    }
}

impl fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use crate::spec::StructSpec;
    use pretty_assertions::assert_eq;

    fn magic(name: &str, byte: u8) -> SpecFormat {
        let header = Attribute::u8("magic").final_value(byte);
        SpecFormat::new(name, &header, StructSpec::new(name).child(&header))
    }

    #[test]
    fn test_first_registered_match_wins() {
        let registry = FormatRegistry::new()
            .register(magic("first", 0xAA))
            .register(magic("second", 0xAA))
            .register(magic("other", 0xBB));

        assert_eq!(registry.detect(&[0xAA]).unwrap().name(), "first");
        assert_eq!(registry.detect(&[0xBB]).unwrap().name(), "other");
        assert!(registry.detect(&[0xCC]).is_none());
        assert!(registry.detect(&[]).is_none());
    }

    #[test]
    fn test_retain_names() {
        let registry = FormatRegistry::new()
            .register(magic("gzip", 0x1F))
            .register(magic("zip", 0x50))
            .register(magic("png", 0x89))
            .retain_names(&["PNG", "gzip"]);
        assert_eq!(registry.names(), vec!["gzip", "png"]);
    }

    #[test]
    fn test_header_size() {
        let wide = SpecFormat::new(
            "wide",
            Attribute::u32_le("magic"),
            StructSpec::new("wide"),
        );
        let registry = FormatRegistry::new().register(magic("narrow", 1)).register(wide);
        assert_eq!(registry.header_size(), 4);
        assert_eq!(FormatRegistry::new().header_size(), 0);
    }

    #[test]
    fn test_zero_size_header_never_matches() {
        let registry = FormatRegistry::new().register(SpecFormat::new(
            "empty",
            StructSpec::new("empty"),
            StructSpec::new("empty"),
        ));
        assert!(registry.detect(&[1, 2, 3]).is_none());
    }
}
