//! Typesetter contract.

use std::path::Path;

use async_trait::async_trait;

use crate::error::CompileFailure;

/// Contract for the external typesetter — pure I/O, no pipeline logic.
///
/// `source_filename` is the deterministic name the source is compiled
/// under (used in the compiler's own log output); `output_path` is where
/// the produced PDF must land.
#[async_trait]
pub trait Typesetter: Send + Sync {
    async fn compile(
        &self,
        source: &str,
        source_filename: &str,
        output_path: &Path,
    ) -> Result<(), CompileFailure>;
}
