//! Content parser contract for non-properties namespaces

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{CONTENT_KEY, ConfigFormat};

/// Converts the raw `content` of a namespace into a key-value map.
pub trait ContentParser: Send + Sync + 'static {
    /// Returns `None` when the content cannot be parsed.
    fn parse(&self, content: &str) -> Option<HashMap<String, String>>;
}

impl<F> ContentParser for F
where
    F: Fn(&str) -> Option<HashMap<String, String>> + Send + Sync + 'static,
{
    fn parse(&self, content: &str) -> Option<HashMap<String, String>> {
        self(content)
    }
}

/// Parsers keyed by namespace format
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: HashMap<ConfigFormat, Arc<dyn ContentParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, format: ConfigFormat, parser: Arc<dyn ContentParser>) {
        self.parsers.insert(format, parser);
    }

    /// Final key-value map for a namespace.
    ///
    /// Properties namespaces are returned as served. Other formats go through
    /// their parser; without one, or when it fails, the map is kept with the
    /// raw `content` key.
    pub fn transform(
        &self,
        namespace: &str,
        configurations: HashMap<String, String>,
    ) -> HashMap<String, String> {
        let format = ConfigFormat::from_namespace(namespace);
        if format.is_properties() {
            return configurations;
        }

        let parsed = self.parsers.get(&format).and_then(|parser| {
            configurations
                .get(CONTENT_KEY)
                .and_then(|content| parser.parse(content))
        });

        match parsed {
            Some(map) => map,
            None => {
                tracing::debug!(
                    "No parsed view for namespace {} ({:?}), keeping raw content",
                    namespace,
                    format
                );
                configurations
            }
        }
    }
}
