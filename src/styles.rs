//! Visual-style store contract.

use async_trait::async_trait;

/// Resolves a style name to the user-authored preamble snippet that the
/// source-generation prompt folds in. Unknown or absent names resolve to
/// an empty block.
#[async_trait]
pub trait StyleResolver: Send + Sync {
    async fn resolve(&self, style_name: Option<&str>) -> String;
}

/// Resolver that always answers with an empty style block.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStyles;

#[async_trait]
impl StyleResolver for NoStyles {
    async fn resolve(&self, _style_name: Option<&str>) -> String {
        String::new()
    }
}
