use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result, anyhow};
use once_cell::sync::Lazy;
use tracing::info;

use crate::appearance::AppearancePalettes;
use crate::normalize::NormalizationBounds;

/// Read-only configuration shared by every normalize/classify call.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticTables {
    pub bounds: NormalizationBounds,
    pub palettes: AppearancePalettes,
}

impl StaticTables {
    pub fn builtin() -> Self {
        Self {
            bounds: NormalizationBounds::builtin(),
            palettes: AppearancePalettes::builtin(),
        }
    }

    /// Built-in tables with optional JSON overrides for either half.
    pub fn load(bounds_file: Option<&Path>, palette_file: Option<&Path>) -> Result<Self> {
        let mut tables = Self::builtin();
        if let Some(path) = bounds_file {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read normalization bounds {}", path.display()))?;
            tables.bounds = serde_json::from_str(&raw)
                .with_context(|| format!("parse normalization bounds {}", path.display()))?;
        }
        if let Some(path) = palette_file {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read appearance palettes {}", path.display()))?;
            tables.palettes = serde_json::from_str(&raw)
                .with_context(|| format!("parse appearance palettes {}", path.display()))?;
        }
        tables.validate()?;
        Ok(tables)
    }

    pub fn validate(&self) -> Result<()> {
        self.bounds.validate().map_err(|e| anyhow!(e))?;
        self.palettes.validate().map_err(|e| anyhow!(e))?;
        Ok(())
    }
}

static TABLES: Lazy<RwLock<Arc<StaticTables>>> =
    Lazy::new(|| RwLock::new(Arc::new(StaticTables::builtin())));

/// Snapshot of the installed tables. Holders keep their snapshot across a reload.
pub fn current() -> Arc<StaticTables> {
    match TABLES.read() {
        Ok(guard) => Arc::clone(&guard),
        Err(poisoned) => Arc::clone(&poisoned.into_inner()),
    }
}

/// Swaps in a new table set. The previous `Arc` is left untouched.
pub fn install(tables: StaticTables) -> Result<Arc<StaticTables>> {
    tables.validate()?;
    let tables = Arc::new(tables);
    let mut guard = match TABLES.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    info!(
        bounds = %tables.bounds.version,
        palettes = %tables.palettes.version,
        "installed static tables"
    );
    *guard = Arc::clone(&tables);
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_swaps_without_touching_old_snapshot() {
        let before = current();
        let mut next = StaticTables::builtin();
        next.bounds.version = "test-reload".to_string();
        install(next).expect("valid tables");
        assert_eq!(current().bounds.version, "test-reload");
        assert_ne!(before.bounds.version, "test-reload");
        install(StaticTables::builtin()).expect("restore builtin");
    }

    #[test]
    fn install_rejects_invalid_tables() {
        let mut bad = StaticTables::builtin();
        bad.palettes.skin.entries.clear();
        assert!(install(bad).is_err());
    }
}
