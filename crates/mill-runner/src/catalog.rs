use crate::base::BaseTask;
use crate::chain::{build_chain, ComposedTask};
use crate::registry::resolve_modules;
use anyhow::{anyhow, Context, Result};
use mill_core::EngineError;
use mill_descriptor::{load_descriptor_file, Descriptor};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A registered tool: its descriptor and the module chain built for it.
/// Shared by every task of the tool.
pub struct ToolIntegration {
    pub descriptor: Arc<Descriptor>,
    pub chain: ComposedTask,
    pub source: Option<PathBuf>,
}

impl ToolIntegration {
    pub fn new(descriptor: Descriptor) -> Result<Self, EngineError> {
        let bindings = resolve_modules(&descriptor)?;
        let chain = build_chain(Box::new(BaseTask), &bindings);
        Ok(Self {
            descriptor: Arc::new(descriptor),
            chain,
            source: None,
        })
    }

    pub fn name(&self) -> String {
        self.descriptor.qualified_name()
    }

    /// Layer names, outermost first, ending with the base task.
    pub fn layers(&self) -> &[String] {
        self.chain.layers()
    }
}

#[derive(Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, Arc<ToolIntegration>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor once per `name@tool-version`; a second
    /// registration of the same tool returns the existing integration.
    pub fn link(&mut self, descriptor: Descriptor) -> Result<Arc<ToolIntegration>, EngineError> {
        let key = descriptor.qualified_name();
        if let Some(existing) = self.tools.get(&key) {
            if existing.descriptor.digest() != descriptor.digest() {
                tracing::warn!(tool = %key, "ignoring a different descriptor registered under the same name");
            }
            return Ok(existing.clone());
        }
        let integration = Arc::new(ToolIntegration::new(descriptor)?);
        tracing::info!(tool = %key, layers = ?integration.layers(), "linked tool");
        self.tools.insert(key, integration.clone());
        Ok(integration)
    }

    pub fn link_from_json_file(&mut self, path: &Path) -> Result<Arc<ToolIntegration>, EngineError> {
        let descriptor = load_descriptor_file(path)?;
        let key = descriptor.qualified_name();
        if let Some(existing) = self.tools.get(&key) {
            return Ok(existing.clone());
        }
        let mut integration = ToolIntegration::new(descriptor)?;
        integration.source = Some(path.to_path_buf());
        let integration = Arc::new(integration);
        tracing::info!(tool = %key, path = %path.display(), "linked tool");
        self.tools.insert(key, integration.clone());
        Ok(integration)
    }

    /// Links every `*.json` file of `dir`, in file name order.
    pub fn link_all(&mut self, dir: &Path) -> Result<Vec<Arc<ToolIntegration>>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("failed to list descriptors in {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        let mut linked = Vec::with_capacity(paths.len());
        for path in paths {
            let tool = self
                .link_from_json_file(&path)
                .map_err(|err| anyhow!(err))
                .with_context(|| format!("failed to link {}", path.display()))?;
            linked.push(tool);
        }
        Ok(linked)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolIntegration>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }
}
